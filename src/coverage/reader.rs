//! Lazy cursor over the binary coverage descriptor format (C4).
//!
//! Records are self-framed: `0x00` module (null-terminated name), `0x01`
//! function (64-bit offset), `0x02` basic-block (32-bit offset relative to
//! the most recent function). `CoverageReader` is an `Iterator` so large
//! descriptors never get pre-materialized into a `Vec`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{Result, TraceError};

const TAG_MODULE: u8 = 0x00;
const TAG_FUNCTION: u8 = 0x01;
const TAG_BASIC_BLOCK: u8 = 0x02;

/// A resolved-relative-to-nothing-yet (module, offset) pair emitted by the
/// reader. Becomes an absolute address once the module's base is known
/// (§3 "Module descriptor").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub module: String,
    pub offset: u64,
    pub single_shot: bool,
}

pub struct CoverageReader<R> {
    inner: BufReader<R>,
    current_module: Option<String>,
    current_function_offset: u64,
    only_function: bool,
    done: bool,
}

impl CoverageReader<File> {
    pub fn open(path: impl AsRef<Path>, only_function: bool) -> Result<Self> {
        let file = File::open(path)?;
        Ok(CoverageReader::new(file, only_function))
    }
}

impl<R: Read> CoverageReader<R> {
    pub fn new(inner: R, only_function: bool) -> Self {
        CoverageReader {
            inner: BufReader::new(inner),
            current_module: None,
            current_function_offset: 0,
            only_function,
            done: false,
        }
    }

    fn read_tag(&mut self) -> std::result::Result<Option<u8>, std::io::Error> {
        let mut b = [0u8; 1];
        match self.inner.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| TraceError::MalformedDescriptor("truncated basic-block offset".to_string()))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.inner
            .read_exact(&mut buf)
            .map_err(|_| TraceError::MalformedDescriptor("truncated function offset".to_string()))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_cstring(&mut self) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let mut b = [0u8; 1];
            self.inner
                .read_exact(&mut b)
                .map_err(|_| TraceError::MalformedDescriptor("truncated module name".to_string()))?;
            if b[0] == 0 {
                break;
            }
            bytes.push(b[0]);
        }
        String::from_utf8(bytes).map_err(|e| TraceError::MalformedDescriptor(e.to_string()))
    }

    /// Skip module/function framing records until one record yields a
    /// placement (a basic-block, or a function entry in `only_function`
    /// mode), or the stream ends. Every placement produced by this catalog
    /// is coverage-typed, so it is always single-shot (§4.3).
    fn advance(&mut self) -> Result<Option<Placement>> {
        loop {
            let tag = match self
                .read_tag()
                .map_err(TraceError::TraceOutputIo)?
            {
                None => return Ok(None),
                Some(t) => t,
            };
            match tag {
                TAG_MODULE => {
                    let name = self.read_cstring()?;
                    self.current_module = Some(name);
                    self.current_function_offset = 0;
                }
                TAG_FUNCTION => {
                    let offset = self.read_u64()?;
                    self.current_function_offset = offset;
                    if self.only_function {
                        let module = self.current_module.clone().ok_or_else(|| {
                            TraceError::MalformedDescriptor(
                                "function record before any module".to_string(),
                            )
                        })?;
                        return Ok(Some(Placement {
                            module,
                            offset,
                            single_shot: true,
                        }));
                    }
                }
                TAG_BASIC_BLOCK => {
                    let bb_offset = self.read_u32()? as u64;
                    if self.only_function {
                        continue;
                    }
                    let module = self.current_module.clone().ok_or_else(|| {
                        TraceError::MalformedDescriptor(
                            "basic-block record before any module".to_string(),
                        )
                    })?;
                    return Ok(Some(Placement {
                        module,
                        offset: self.current_function_offset + bb_offset,
                        single_shot: true,
                    }));
                }
                other => {
                    return Err(TraceError::MalformedDescriptor(format!(
                        "unknown record tag {:#x}",
                        other
                    )));
                }
            }
        }
    }
}

impl<R: Read> Iterator for CoverageReader<R> {
    type Item = Placement;

    fn next(&mut self) -> Option<Placement> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(placement)) => Some(placement),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_module(buf: &mut Vec<u8>, name: &str) {
        buf.push(TAG_MODULE);
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
    }

    fn record_function(buf: &mut Vec<u8>, offset: u64) {
        buf.push(TAG_FUNCTION);
        buf.extend_from_slice(&offset.to_le_bytes());
    }

    fn record_bb(buf: &mut Vec<u8>, offset: u32) {
        buf.push(TAG_BASIC_BLOCK);
        buf.extend_from_slice(&offset.to_le_bytes());
    }

    #[test]
    fn emits_placements_in_order() {
        let mut buf = Vec::new();
        record_module(&mut buf, "a");
        record_function(&mut buf, 0x1000);
        record_bb(&mut buf, 0x0);
        record_bb(&mut buf, 0x4);
        record_module(&mut buf, "b");
        record_function(&mut buf, 0x2000);
        record_bb(&mut buf, 0x8);

        let reader = CoverageReader::new(std::io::Cursor::new(buf), false);
        let placements: Vec<_> = reader.map(|p| (p.module, p.offset)).collect();
        assert_eq!(
            placements,
            vec![
                ("a".to_string(), 0x1000),
                ("a".to_string(), 0x1004),
                ("b".to_string(), 0x2008),
            ]
        );
    }

    #[test]
    fn empty_module_yields_no_placements() {
        let mut buf = Vec::new();
        record_module(&mut buf, "a");
        let reader = CoverageReader::new(std::io::Cursor::new(buf), false);
        assert_eq!(reader.count(), 0);
    }

    #[test]
    fn only_function_mode_emits_function_entries() {
        let mut buf = Vec::new();
        record_module(&mut buf, "a");
        record_function(&mut buf, 0x1000);
        record_bb(&mut buf, 0x0);
        record_function(&mut buf, 0x2000);

        let reader = CoverageReader::new(std::io::Cursor::new(buf), true);
        let placements: Vec<_> = reader.map(|p| p.offset).collect();
        assert_eq!(placements, vec![0x1000, 0x2000]);
    }

    #[test]
    fn unknown_tag_ends_stream() {
        let buf = vec![0xff];
        let reader = CoverageReader::new(std::io::Cursor::new(buf), false);
        assert_eq!(reader.count(), 0);
    }
}
