//! Session traffic capture.
//!
//! Captures are side-tagged text dumps ("smcap"), one file per session,
//! written under the configured directory with the configured prefix and
//! suffix.  The pcap formats are accepted in configuration for
//! compatibility but currently write the same text form.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::policy::profiles::CaptureFormat;
use crate::session::flow::Side;

//----------- CaptureConfig ----------------------------------------------------

/// Where and how capture files are written.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct CaptureConfig {
    /// Directory capture files are written to.
    pub write_payload_dir: Utf8PathBuf,

    /// Prefix of every capture file name.
    pub write_payload_file_prefix: String,

    /// Suffix (extension) of every capture file name.
    pub write_payload_file_suffix: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            write_payload_dir: "/var/local/interpose/data".into(),
            write_payload_file_prefix: String::new(),
            write_payload_file_suffix: "smcap".into(),
        }
    }
}

//----------- CaptureWriter ----------------------------------------------------

/// A per-session capture file.
#[derive(Debug)]
pub struct CaptureWriter {
    out: BufWriter<File>,
}

impl CaptureWriter {
    pub fn open(
        config: &CaptureConfig,
        _format: CaptureFormat,
        session_name: &str,
    ) -> io::Result<Self> {
        fs::create_dir_all(&config.write_payload_dir)?;
        let name = format!(
            "{}{}.{}",
            config.write_payload_file_prefix, session_name, config.write_payload_file_suffix
        );
        let path = config.write_payload_dir.join(name);
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    /// Append one side-tagged chunk as a hex dump block.
    pub fn write(&mut self, side: Side, data: &[u8]) {
        let _ = writeln!(self.out, "{}: {} bytes", side.tag(), data.len());
        for row in data.chunks(16) {
            let mut hex = String::with_capacity(3 * 16);
            let mut text = String::with_capacity(16);
            for byte in row {
                hex.push_str(&format!("{byte:02x} "));
                text.push(if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                });
            }
            let _ = writeln!(self.out, "    {hex:<48} {text}");
        }
        let _ = self.out.flush();
    }
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_side_tagged_hex_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig {
            write_payload_dir: Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            write_payload_file_prefix: "test-".into(),
            write_payload_file_suffix: "smcap".into(),
        };

        let mut writer = CaptureWriter::open(&config, CaptureFormat::Smcap, "s1").unwrap();
        writer.write(Side::Left, b"GET / HTTP/1.1\r\n");
        writer.write(Side::Right, b"HTTP/1.1 200 OK\r\n");
        drop(writer);

        let contents = fs::read_to_string(dir.path().join("test-s1.smcap")).unwrap();
        assert!(contents.starts_with("L: 16 bytes"));
        assert!(contents.contains("R: 17 bytes"));
        assert!(contents.contains("GET / HTTP/1.1"));
    }
}
