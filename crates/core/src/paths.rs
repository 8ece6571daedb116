use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".portbridge"))
            .unwrap_or_else(|| PathBuf::from(".portbridge"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.base.join("storage")
    }

    /// Backing file for a durable named storage area (`local`, `sync`).
    pub fn area_file(&self, area: &str) -> PathBuf {
        let safe = area.replace([':', '/', '\\'], "_");
        self.storage_dir().join(format!("{}.json", safe))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.storage_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
