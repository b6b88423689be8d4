//! Per-handle packet capture in text2pcap format
//!
//! The admin API can toggle a dump of every RTP/RTCP/data payload relayed
//! through a handle. Lines are written in the text format `text2pcap`
//! understands, one packet per line:
//! `<I|O> <HH:MM:SS.ffffff> 000000 <hex bytes> <protocol>`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Payload kind recorded with each line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
    Data,
}

impl PacketKind {
    fn label(self) -> &'static str {
        match self {
            PacketKind::Rtp => "RTP",
            PacketKind::Rtcp => "RTCP",
            PacketKind::Data => "DATA",
        }
    }
}

/// An open capture file
pub struct PacketCapture {
    path: PathBuf,
    file: Mutex<File>,
}

impl PacketCapture {
    /// Open (or truncate) the capture file. A missing filename gets a
    /// timestamped default; a missing folder means the current directory.
    pub fn create(
        folder: Option<&str>,
        filename: Option<&str>,
        truncate: bool,
    ) -> std::io::Result<Self> {
        let name = match filename {
            Some(name) => name.to_string(),
            None => format!(
                "rtcgate-dump-{}.txt",
                chrono::Utc::now().format("%Y%m%d%H%M%S")
            ),
        };
        let path = match folder {
            Some(folder) => Path::new(folder).join(name),
            None => PathBuf::from(name),
        };
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one packet. `incoming` marks the direction relative to the
    /// gateway.
    pub fn dump(&self, incoming: bool, kind: PacketKind, buf: &[u8]) -> std::io::Result<()> {
        let mut line = String::with_capacity(32 + buf.len() * 3);
        line.push(if incoming { 'I' } else { 'O' });
        line.push(' ');
        line.push_str(&chrono::Utc::now().format("%H:%M:%S.%6f").to_string());
        line.push_str(" 000000");
        for byte in buf {
            line.push_str(&format!(" {byte:02x}"));
        }
        line.push(' ');
        line.push_str(kind.label());
        line.push('\n');

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
    }
}
