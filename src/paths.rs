use std::path::PathBuf;
use std::sync::OnceLock;

static EXE_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the directory containing the executable.
pub fn get_exe_dir() -> &'static PathBuf {
    EXE_DIR.get_or_init(|| {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."))
    })
}

/// Returns the logs directory: `<exe_dir>/logs/`
pub fn get_logs_dir() -> PathBuf {
    get_exe_dir().join("logs")
}

/// Returns the session output root: `<exe_dir>/output/`
pub fn get_output_dir() -> PathBuf {
    get_exe_dir().join("output")
}

/// Returns the directory debug crops are written to: `<exe_dir>/debug_images/`
pub fn get_debug_images_dir() -> PathBuf {
    get_exe_dir().join("debug_images")
}

/// Returns the default config location: `<exe_dir>/config.json`
pub fn get_default_config_path() -> PathBuf {
    get_exe_dir().join("config.json")
}

/// Returns the locally managed tesseract directory.
pub fn get_tesseract_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("generals-tracker")
        .join("tesseract")
}

/// Resolves a config-relative path against the executable directory.
///
/// Absolute paths are returned unchanged.
pub fn resolve_relative(path: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { get_exe_dir().join(p) }
}

/// Ensures all output directories exist. Call at startup.
pub fn ensure_directories() -> std::io::Result<()> {
    std::fs::create_dir_all(get_logs_dir())?;
    std::fs::create_dir_all(get_output_dir())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_keeps_absolute() {
        let abs = std::env::temp_dir().join("regions.json");
        assert_eq!(resolve_relative(abs.to_str().unwrap()), abs);
    }

    #[test]
    fn test_resolve_relative_joins_exe_dir() {
        assert_eq!(resolve_relative("regions.json"), get_exe_dir().join("regions.json"));
    }
}
