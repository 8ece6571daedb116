use chrono::{DateTime, Utc};
use portbridge_core::message::Hello;
use portbridge_core::{FrameId, PortContext, PortSessionId, TabId};
use std::fmt;

/// Lifecycle of one port as seen by the worker.
///
/// `Connecting` covers the window between the transport opening and HELLO;
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Established,
    Attached,
    Detached,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Established => write!(f, "established"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Detached => write!(f, "detached"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachError {
    /// Content-script sessions are bound to their tab for life.
    ContentScript,
    Closed,
}

impl fmt::Display for AttachError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachError::ContentScript => {
                write!(f, "content-script sessions cannot change tab binding")
            }
            AttachError::Closed => write!(f, "session is closed"),
        }
    }
}

/// Worker-side record of one live port and its negotiated identity.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSession {
    pub id: PortSessionId,
    pub context: PortContext,
    pub instance_id: String,
    pub tab_id: Option<TabId>,
    pub frame_id: Option<FrameId>,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
}

impl PortSession {
    /// Build the session for a HELLO. A fresh id is allocated every time.
    pub fn establish(hello: &Hello) -> Self {
        let state = if hello.tab_id.is_some() {
            SessionState::Attached
        } else {
            SessionState::Established
        };
        Self {
            id: PortSessionId::generate(),
            context: hello.context,
            instance_id: hello.instance_id.clone(),
            tab_id: hello.tab_id,
            frame_id: hello.frame_id,
            created_at: Utc::now(),
            state,
        }
    }

    pub fn is_app(&self) -> bool {
        self.context == PortContext::ExtensionApp
    }

    /// Tab this session currently speaks for, if any.
    pub fn bound_tab(&self) -> Option<TabId> {
        match self.state {
            SessionState::Attached => self.tab_id,
            _ => None,
        }
    }

    pub fn attach(&mut self, tab_id: TabId, frame_id: Option<FrameId>) -> Result<(), AttachError> {
        if self.state == SessionState::Closed {
            return Err(AttachError::Closed);
        }
        if self.context == PortContext::ContentScript {
            return Err(AttachError::ContentScript);
        }
        self.tab_id = Some(tab_id);
        self.frame_id = frame_id;
        self.state = SessionState::Attached;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<(), AttachError> {
        if self.state == SessionState::Closed {
            return Err(AttachError::Closed);
        }
        if self.context == PortContext::ContentScript {
            return Err(AttachError::ContentScript);
        }
        self.tab_id = None;
        self.frame_id = None;
        self.state = SessionState::Detached;
        Ok(())
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(context: PortContext, tab_id: Option<TabId>) -> Hello {
        Hello {
            context,
            instance_id: "inst".to_string(),
            tab_id,
            frame_id: None,
        }
    }

    #[test]
    fn test_content_script_with_tab_is_bound_at_creation() {
        let s = PortSession::establish(&hello(PortContext::ContentScript, Some(42)));
        assert_eq!(s.state, SessionState::Attached);
        assert_eq!(s.bound_tab(), Some(42));
    }

    #[test]
    fn test_app_without_tab_is_unbound() {
        let s = PortSession::establish(&hello(PortContext::ExtensionApp, None));
        assert_eq!(s.state, SessionState::Established);
        assert_eq!(s.bound_tab(), None);
        assert!(s.is_app());
    }

    #[test]
    fn test_attach_detach_cycle() {
        let mut s = PortSession::establish(&hello(PortContext::ExtensionApp, None));
        s.attach(7, Some(0)).unwrap();
        assert_eq!(s.state, SessionState::Attached);
        assert_eq!(s.bound_tab(), Some(7));

        s.detach().unwrap();
        assert_eq!(s.state, SessionState::Detached);
        assert_eq!(s.bound_tab(), None);

        s.attach(8, None).unwrap();
        assert_eq!(s.bound_tab(), Some(8));
    }

    #[test]
    fn test_content_script_cannot_attach() {
        let mut s = PortSession::establish(&hello(PortContext::ContentScript, Some(1)));
        let before = s.clone();
        assert_eq!(s.attach(2, None), Err(AttachError::ContentScript));
        assert_eq!(s.detach(), Err(AttachError::ContentScript));
        assert_eq!(s, before);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut s = PortSession::establish(&hello(PortContext::ExtensionApp, None));
        s.close();
        assert_eq!(s.attach(1, None), Err(AttachError::Closed));
        assert_eq!(s.state, SessionState::Closed);
    }

    #[test]
    fn test_reconnect_gets_fresh_id() {
        let h = hello(PortContext::ExtensionApp, None);
        assert_ne!(PortSession::establish(&h).id, PortSession::establish(&h).id);
    }
}
