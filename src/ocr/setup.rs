use anyhow::{anyhow, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

use crate::paths::get_tesseract_dir;

const TESSDATA_REPO: &str = "https://github.com/tesseract-ocr/tessdata/raw/main";

#[cfg(windows)]
const TESSERACT_EXE: &str = "tesseract.exe";
#[cfg(not(windows))]
const TESSERACT_EXE: &str = "tesseract";

#[cfg(windows)]
const SYSTEM_TESSERACT_DIRS: &[&str] =
    &[r"C:\Program Files\Tesseract-OCR", r"C:\Program Files (x86)\Tesseract-OCR"];
#[cfg(not(windows))]
const SYSTEM_TESSERACT_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

#[cfg(windows)]
const SYSTEM_TESSDATA_DIRS: &[&str] = &[
    r"C:\Program Files\Tesseract-OCR\tessdata",
    r"C:\Program Files (x86)\Tesseract-OCR\tessdata",
];
#[cfg(not(windows))]
const SYSTEM_TESSDATA_DIRS: &[&str] = &[
    "/usr/share/tesseract-ocr/5/tessdata",
    "/usr/share/tesseract-ocr/4.00/tessdata",
    "/usr/share/tessdata",
    "/usr/local/share/tessdata",
    "/opt/homebrew/share/tessdata",
];

pub struct TesseractPaths {
    pub executable: PathBuf,
    pub tessdata: PathBuf,
}

/// Locates tesseract and makes sure traineddata for every language exists,
/// downloading missing files into the local tessdata directory.
pub fn ensure_tesseract(languages: &[String]) -> Result<TesseractPaths> {
    let executable = find_tesseract_executable()?;

    if let Ok(tessdata) = find_tessdata_dir(languages) {
        info!("Tesseract found at: {} (tessdata {})", executable.display(), tessdata.display());
        return Ok(TesseractPaths { executable, tessdata });
    }

    info!("Traineddata not found locally, downloading...");
    let tessdata = get_tesseract_dir().join("tessdata");
    fs::create_dir_all(&tessdata)?;
    for language in languages {
        if !tessdata.join(format!("{}.traineddata", language)).exists() {
            download_tessdata(&tessdata, language)?;
        }
    }

    info!("Tesseract ready, tessdata at: {}", tessdata.display());
    Ok(TesseractPaths { executable, tessdata })
}

/// Downloads `<language>.traineddata` from the tessdata repository.
fn download_tessdata(tessdata_dir: &Path, language: &str) -> Result<()> {
    let url = format!("{}/{}.traineddata", TESSDATA_REPO, language);
    let target = tessdata_dir.join(format!("{}.traineddata", language));

    info!("Downloading {}.traineddata...", language);

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()?;

    let response = client.get(&url).header("User-Agent", "generals-tracker").send()?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Failed to download {}.traineddata: HTTP {}",
            language,
            response.status()
        ));
    }

    let bytes = response.bytes()?;
    let mut file = fs::File::create(&target)?;
    file.write_all(&bytes)?;

    info!("Downloaded {}.traineddata ({} bytes)", language, bytes.len());
    Ok(())
}

/// Finds the Tesseract executable, checking our local dir first, then PATH,
/// then the usual install locations.
pub fn find_tesseract_executable() -> Result<PathBuf> {
    let local_exe = get_tesseract_dir().join(TESSERACT_EXE);
    if local_exe.exists() {
        return Ok(local_exe);
    }

    if let Ok(output) = Command::new("tesseract").arg("--version").output() {
        if output.status.success() {
            return Ok(PathBuf::from("tesseract"));
        }
    }

    for dir in SYSTEM_TESSERACT_DIRS {
        let p = Path::new(dir).join(TESSERACT_EXE);
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "Tesseract not found. Install Tesseract-OCR or copy it to {}",
        get_tesseract_dir().display()
    ))
}

/// Finds a tessdata directory holding traineddata for every language.
pub fn find_tessdata_dir(languages: &[String]) -> Result<PathBuf> {
    let has_all = |dir: &Path| {
        languages.iter().all(|l| dir.join(format!("{}.traineddata", l)).exists())
    };

    let mut candidates = vec![get_tesseract_dir().join("tessdata")];
    if let Ok(prefix) = std::env::var("TESSDATA_PREFIX") {
        candidates.push(PathBuf::from(&prefix));
        candidates.push(PathBuf::from(&prefix).join("tessdata"));
    }
    candidates.extend(SYSTEM_TESSDATA_DIRS.iter().map(PathBuf::from));

    candidates.into_iter().find(|dir| has_all(dir)).ok_or_else(|| {
        anyhow!("tessdata directory not found for languages: {}", languages.join("+"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tessdata_lookup_fails_for_unknown_language() {
        let languages = vec!["definitely_not_a_language".to_string()];
        assert!(find_tessdata_dir(&languages).is_err());
    }
}
