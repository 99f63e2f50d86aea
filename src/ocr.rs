//! Text recognition on cropped plate regions.
//!
//! `TesseractRecognizer` pipes a PNG crop through the `tesseract` executable
//! in single-line mode and parses its TSV output. `ScriptedRecognizer`
//! replays queued readings for tests and demos.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, VecDeque};
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};

use crate::frame::Frame;

/// One recognised line of text.
#[derive(Clone, Debug, PartialEq)]
pub struct TextReading {
    pub text: String,
    /// Recogniser confidence in `0..=1`.
    pub confidence: f32,
}

impl TextReading {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// OCR engine contract.
pub trait TextRecognizer: Send {
    /// Readings in engine order. Empty when nothing legible was found.
    fn recognize_text(&mut self, crop: &Frame) -> Result<Vec<TextReading>>;
}

const DEFAULT_TESSERACT: &str = "tesseract";
/// Page segmentation mode 7: treat the image as a single text line.
const SINGLE_LINE_PSM: &str = "7";

#[derive(Clone, Debug)]
pub struct TesseractRecognizer {
    command: String,
    language: String,
}

impl TesseractRecognizer {
    pub fn new() -> Self {
        Self {
            command: DEFAULT_TESSERACT.to_string(),
            language: "eng".to_string(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TextRecognizer for TesseractRecognizer {
    fn recognize_text(&mut self, crop: &Frame) -> Result<Vec<TextReading>> {
        let mut png = Vec::new();
        crop.to_rgb_image()?
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .context("encode crop as PNG")?;

        let mut child = Command::new(&self.command)
            .args(["stdin", "stdout", "--psm", SINGLE_LINE_PSM, "-l"])
            .arg(&self.language)
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.command))?;
        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("{} stdin unavailable", self.command))?;
            stdin.write_all(&png).context("write crop to tesseract")?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", self.command))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed on frame {}: {}",
                self.command,
                crop.ordinal,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Group word rows of tesseract TSV output into lines.
///
/// Columns: level page block par line word left top width height conf text.
/// Rows with negative confidence are layout rows and carry no text.
fn parse_tsv(tsv: &str) -> Vec<TextReading> {
    let mut lines: BTreeMap<(u32, u32, u32, u32), (Vec<String>, Vec<f32>)> = BTreeMap::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 {
            continue;
        }
        let text = cols[11].trim();
        let Ok(conf) = cols[10].trim().parse::<f32>() else {
            continue;
        };
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        let key: Vec<u32> = cols[1..5]
            .iter()
            .filter_map(|col| col.trim().parse().ok())
            .collect();
        let &[page, block, par, line] = key.as_slice() else {
            continue;
        };
        let entry = lines.entry((page, block, par, line)).or_default();
        entry.0.push(text.to_string());
        entry.1.push(conf);
    }
    lines
        .into_values()
        .map(|(words, confs)| {
            let mean = confs.iter().sum::<f32>() / confs.len() as f32;
            TextReading::new(words.join(" "), (mean / 100.0).clamp(0.0, 1.0))
        })
        .collect()
}

/// Scripted result for one `recognize_text` call.
#[derive(Clone, Debug)]
pub enum ScriptedReading {
    Readings(Vec<TextReading>),
    Fail(String),
}

/// Replays queued readings; returns nothing once the script is exhausted.
/// Clones share the script, so a test can keep feeding a recogniser that has
/// been moved into the recognition stage.
#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    script: Arc<Mutex<VecDeque<ScriptedReading>>>,
    calls: Arc<Mutex<u64>>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one call's worth of readings.
    pub fn push_texts(&self, texts: &[&str]) {
        let readings = texts.iter().map(|text| TextReading::new(*text, 0.9)).collect();
        self.lock_script()
            .push_back(ScriptedReading::Readings(readings));
    }

    pub fn push_failure(&self, message: &str) {
        self.lock_script()
            .push_back(ScriptedReading::Fail(message.to_string()));
    }

    pub fn pending(&self) -> usize {
        self.lock_script().len()
    }

    pub fn calls(&self) -> u64 {
        *self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<ScriptedReading>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn recognize_text(&mut self, _crop: &Frame) -> Result<Vec<TextReading>> {
        *self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        match self.lock_script().pop_front() {
            Some(ScriptedReading::Readings(readings)) => Ok(readings),
            Some(ScriptedReading::Fail(message)) => Err(anyhow!(message)),
            None => Ok(Vec::new()),
        }
    }
}
