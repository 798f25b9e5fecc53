//! Packet capture for LocoNet traffic
//!
//! Writes classic pcap (v2.4) with a user-defined link type, one record
//! per LocoNet frame in either direction, for offline analysis.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const LINKTYPE_USER0: u32 = 147;

pub struct PcapWriter {
    out: Box<dyn Write + Send>,
}

impl PcapWriter {
    pub fn to_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Self::new(Box::new(file))
    }

    pub fn to_stdout() -> io::Result<Self> {
        Self::new(Box::new(io::stdout()))
    }

    fn new(mut out: Box<dyn Write + Send>) -> io::Result<Self> {
        out.write_all(&PCAP_MAGIC.to_le_bytes())?;
        out.write_all(&2u16.to_le_bytes())?; // version major
        out.write_all(&4u16.to_le_bytes())?; // version minor
        out.write_all(&0i32.to_le_bytes())?; // thiszone
        out.write_all(&0u32.to_le_bytes())?; // sigfigs
        out.write_all(&128u32.to_le_bytes())?; // snaplen
        out.write_all(&LINKTYPE_USER0.to_le_bytes())?;
        out.flush()?;
        Ok(Self { out })
    }

    /// Append one frame; errors are reported once by the caller
    pub fn record(&mut self, frame: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.out.write_all(&(now.as_secs() as u32).to_le_bytes())?;
        self.out.write_all(&now.subsec_micros().to_le_bytes())?;
        self.out.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.out.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.out.write_all(frame)?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_record_layout() {
        let path = std::env::temp_dir().join(format!("railhub-pcap-{}.pcap", std::process::id()));
        {
            let mut writer = PcapWriter::to_file(&path).unwrap();
            writer.record(&[0x83, 0x7C]).unwrap();
        }
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(&bytes[..4], &PCAP_MAGIC.to_le_bytes());
        assert_eq!(&bytes[20..24], &LINKTYPE_USER0.to_le_bytes());
        // record header (16 bytes) + 2 frame bytes
        assert_eq!(bytes.len(), 24 + 16 + 2);
        assert_eq!(&bytes[24 + 8..24 + 12], &2u32.to_le_bytes());
        assert_eq!(&bytes[40..42], &[0x83, 0x7C]);
    }
}
