use anyhow::{anyhow, Result};
use image::GrayImage;
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::debug;

use super::setup::ensure_tesseract;

/// One piece of recognized text with its confidence in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct OcrFragment {
    pub text: String,
    pub confidence: f32,
}

/// A text recognizer. Implementations return every fragment they found; filtering
/// by confidence is the caller's job.
pub trait OcrBackend: Send {
    fn name(&self) -> &str;
    fn recognize(&self, img: &GrayImage) -> Result<Vec<OcrFragment>>;
}

/// Maps EasyOCR-style language codes to tesseract traineddata names.
pub fn tesseract_language(code: &str) -> String {
    match code {
        "en" => "eng",
        "ja" => "jpn",
        "ko" => "kor",
        "ch_sim" | "zh" => "chi_sim",
        "ch_tra" => "chi_tra",
        "de" => "deu",
        "fr" => "fra",
        "es" => "spa",
        "pt" => "por",
        "ru" => "rus",
        other => other,
    }
    .to_string()
}

/// Runs the tesseract CLI per crop, one fragment per recognized line.
pub struct TesseractBackend {
    executable: PathBuf,
    tessdata: PathBuf,
    languages: String,
}

impl TesseractBackend {
    pub fn new(languages: &[String]) -> Result<Self> {
        let mut mapped: Vec<String> = languages.iter().map(|l| tesseract_language(l)).collect();
        if mapped.is_empty() {
            mapped.push("eng".to_string());
        }
        let paths = ensure_tesseract(&mapped)?;
        Ok(Self {
            executable: paths.executable,
            tessdata: paths.tessdata,
            languages: mapped.join("+"),
        })
    }
}

impl OcrBackend for TesseractBackend {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn recognize(&self, img: &GrayImage) -> Result<Vec<OcrFragment>> {
        // Save image to temporary file
        let temp_input = NamedTempFile::with_suffix(".png")?;
        img.save(temp_input.path())?;

        // Tesseract appends .tsv to the output base
        let temp_output = NamedTempFile::new()?;
        let output_base = temp_output.path().to_string_lossy().to_string();

        let output = Command::new(&self.executable)
            .arg(temp_input.path())
            .arg(&output_base)
            .arg("--tessdata-dir")
            .arg(&self.tessdata)
            .arg("-l")
            .arg(&self.languages)
            .arg("--psm")
            .arg("6") // Assume single uniform block of text
            .arg("tsv")
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Tesseract failed: {}", stderr));
        }

        let tsv_path = format!("{}.tsv", output_base);
        let tsv_content = std::fs::read_to_string(&tsv_path)
            .map_err(|e| anyhow!("Failed to read Tesseract output: {}", e))?;
        let _ = std::fs::remove_file(&tsv_path);

        let fragments = parse_tsv_output(&tsv_content);
        debug!("Tesseract returned {} line(s)", fragments.len());
        Ok(fragments)
    }
}

/// Groups TSV word rows into lines. Line confidence is the mean word confidence
/// scaled from tesseract's 0-100 to 0-1.
fn parse_tsv_output(tsv: &str) -> Vec<OcrFragment> {
    let mut fragments = Vec::new();
    let mut current_key: Option<(i32, i32, i32)> = None;
    let mut words: Vec<&str> = Vec::new();
    let mut conf_sum: f32 = 0.0;

    for line in tsv.lines().skip(1) {
        // level, page_num, block_num, par_num, line_num, word_num,
        // left, top, width, height, conf, text
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            continue;
        }

        let level: i32 = fields[0].parse().unwrap_or(-1);
        if level != 5 {
            continue;
        }
        let text = fields[11].trim();
        let conf: f32 = fields[10].trim().parse().unwrap_or(-1.0);
        if text.is_empty() || conf < 0.0 {
            continue;
        }

        let key = (
            fields[2].parse().unwrap_or(-1),
            fields[3].parse().unwrap_or(-1),
            fields[4].parse().unwrap_or(-1),
        );
        if current_key.is_some_and(|k| k != key) {
            flush_line(&mut fragments, &mut words, &mut conf_sum);
        }
        current_key = Some(key);
        words.push(text);
        conf_sum += conf;
    }
    flush_line(&mut fragments, &mut words, &mut conf_sum);

    fragments
}

fn flush_line(fragments: &mut Vec<OcrFragment>, words: &mut Vec<&str>, conf_sum: &mut f32) {
    if !words.is_empty() {
        fragments.push(OcrFragment {
            text: words.join(" "),
            confidence: (*conf_sum / words.len() as f32 / 100.0).clamp(0.0, 1.0),
        });
    }
    words.clear();
    *conf_sum = 0.0;
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_parse_tsv_groups_lines() {
        let tsv = format!(
            "{}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t100\t40\t-1\t\n\
             5\t1\t1\t1\t1\t1\t0\t0\t20\t10\t90\tPower\n\
             5\t1\t1\t1\t1\t2\t25\t0\t40\t10\t80\t143,657\n\
             5\t1\t1\t1\t2\t1\t0\t20\t30\t10\t60\t12\n",
            HEADER
        );
        let fragments = parse_tsv_output(&tsv);

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].text, "Power 143,657");
        assert!((fragments[0].confidence - 0.85).abs() < 1e-6);
        assert_eq!(fragments[1].text, "12");
        assert!((fragments[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_parse_tsv_skips_blank_and_unscored_words() {
        let tsv = format!(
            "{}\n5\t1\t1\t1\t1\t1\t0\t0\t20\t10\t-1\tjunk\n5\t1\t1\t1\t1\t2\t0\t0\t20\t10\t95\t \n",
            HEADER
        );
        assert!(parse_tsv_output(&tsv).is_empty());
    }

    #[test]
    fn test_language_mapping() {
        assert_eq!(tesseract_language("en"), "eng");
        assert_eq!(tesseract_language("ch_sim"), "chi_sim");
        assert_eq!(tesseract_language("eng"), "eng");
    }
}
