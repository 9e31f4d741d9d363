use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub upload_dir: String,
    pub public_dir: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Ok(AppConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "80".to_string())
                .parse()
                .unwrap_or(80),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            upload_dir: env::var("UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string()),
            public_dir: env::var("PUBLIC_DIR").unwrap_or_else(|_| "public".to_string()),
        })
    }

    pub fn devices_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("devices.json")
    }

    pub fn rooms_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("rooms.json")
    }
}
