use super::{MarkerSource, RawFrame};
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

/// Replays detector frames recorded as JSON lines (one `RawFrame` per line)
pub struct ReplaySource {
    lines: Lines<BufReader<File>>,
    line_number: usize,
}

impl ReplaySource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open frame file {}", path.display()))?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

impl MarkerSource for ReplaySource {
    fn refresh(&mut self) -> Result<Option<RawFrame>> {
        for line in self.lines.by_ref() {
            self.line_number += 1;
            let line = line.context("Failed to read frame file")?;
            if line.trim().is_empty() {
                continue;
            }
            let frame = serde_json::from_str(&line)
                .with_context(|| format!("Malformed frame at line {}", self.line_number))?;
            return Ok(Some(frame));
        }
        Ok(None)
    }
}

/// In-memory queue of frames, drained one per refresh
#[derive(Default)]
pub struct ScriptedSource {
    frames: VecDeque<RawFrame>,
}

impl ScriptedSource {
    pub fn new(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn push(&mut self, frame: RawFrame) {
        self.frames.push_back(frame);
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl MarkerSource for ScriptedSource {
    fn refresh(&mut self) -> Result<Option<RawFrame>> {
        Ok(self.frames.pop_front())
    }
}
