use std::collections::HashMap;

use crate::memory::config::BackingMode;

/// Functional contents of memory, kept apart from timing.  Untouched bytes read as zero.
#[derive(Debug)]
pub struct BackingStore {
    mode: BackingMode,
    line_size: u64,
    lines: HashMap<u64, Vec<u8>>,
}

impl BackingStore {
    pub fn new(mode: BackingMode, line_size: u64) -> Self {
        Self {
            mode,
            line_size: line_size.max(1),
            lines: HashMap::new(),
        }
    }

    pub fn resident_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn read(&self, addr: u64, size: u32) -> Vec<u8> {
        let mut out = vec![0; size as usize];
        if self.mode == BackingMode::None {
            return out;
        }
        for (i, byte) in out.iter_mut().enumerate() {
            let at = addr + i as u64;
            let base = at - at % self.line_size;
            if let Some(line) = self.lines.get(&base) {
                *byte = line[(at - base) as usize];
            }
        }
        out
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) {
        if self.mode == BackingMode::None {
            return;
        }
        let line_size = self.line_size;
        for (i, byte) in data.iter().enumerate() {
            let at = addr + i as u64;
            let base = at - at % line_size;
            let line = self
                .lines
                .entry(base)
                .or_insert_with(|| vec![0; line_size as usize]);
            line[(at - base) as usize] = *byte;
        }
    }
}
