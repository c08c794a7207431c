//! Copy-stream wire format spoken with a remote `scp -t` sink.
//!
//! Control lines are plain text terminated by `\n`:
//! - `C<mode> <length> <name>`: a file follows; `length` raw bytes, then a
//!   single `\0` sentinel
//! - `D<mode> 0 <name>`: enter (creating if needed) a directory
//! - `E`: leave the current directory
//!
//! Modes are four octal digits. The sink answers every line and every file
//! body with an ack byte: `\0` ok, `\x01` warning, `\x02` fatal; the last two
//! are followed by a message line.

use crate::error::{Result, SyncError};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Read, Write};

/// Terminates every file body
pub const SENTINEL: u8 = 0;

const ACK_OK: u8 = 0;
const ACK_WARNING: u8 = 1;
const ACK_FATAL: u8 = 2;

/// Longest control or message line accepted from the peer
const MAX_LINE: usize = 64 * 1024;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    File { mode: u32, len: u64, name: String },
    Dir { mode: u32, name: String },
    EndDir,
}

impl Record {
    pub fn file(mode: u32, len: u64, name: impl Into<String>) -> Self {
        Record::File {
            mode: mode & 0o7777,
            len,
            name: name.into(),
        }
    }

    pub fn dir(mode: u32, name: impl Into<String>) -> Self {
        Record::Dir {
            mode: mode & 0o7777,
            name: name.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let line = match self {
            Record::File { mode, len, name } => format!("C{:04o} {} {}\n", mode, len, name),
            Record::Dir { mode, name } => format!("D{:04o} 0 {}\n", mode, name),
            Record::EndDir => "E\n".to_string(),
        };
        let mut buf = BytesMut::with_capacity(line.len());
        buf.put_slice(line.as_bytes());
        buf.freeze()
    }

    /// Parse one control line (with or without its trailing newline).
    #[cfg(test)]
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let bad = |why: &str| SyncError::transfer("parse", line, why);

        let (kind, rest) = line
            .split_at_checked(1)
            .ok_or_else(|| bad("empty control line"))?;
        if kind == "E" {
            return if rest.is_empty() {
                Ok(Record::EndDir)
            } else {
                Err(bad("trailing data after E"))
            };
        }

        let mut fields = rest.splitn(3, ' ');
        let mode = fields.next().ok_or_else(|| bad("missing mode"))?;
        let len = fields.next().ok_or_else(|| bad("missing length"))?;
        let name = fields.next().ok_or_else(|| bad("missing name"))?;

        let mode = u32::from_str_radix(mode, 8).map_err(|_| bad("invalid mode"))?;
        let len: u64 = len.parse().map_err(|_| bad("invalid length"))?;
        if name.is_empty() || name.contains('/') || name == ".." {
            return Err(bad("invalid name"));
        }

        match kind {
            "C" => Ok(Record::file(mode, len, name)),
            "D" => Ok(Record::dir(mode, name)),
            _ => Err(bad("unknown record type")),
        }
    }
}

// =============================================================================
// Acks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Ok,
    Warning(String),
    Fatal(String),
}

pub fn read_ack<R: Read>(reader: &mut R) -> io::Result<Ack> {
    let mut code = [0u8; 1];
    reader.read_exact(&mut code)?;
    match code[0] {
        ACK_OK => Ok(Ack::Ok),
        ACK_WARNING => Ok(Ack::Warning(read_line(reader)?)),
        ACK_FATAL => Ok(Ack::Fatal(read_line(reader)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected ack byte 0x{:02x}", other),
        )),
    }
}

#[cfg(test)]
pub fn write_ack<W: Write>(writer: &mut W, ack: &Ack) -> io::Result<()> {
    match ack {
        Ack::Ok => writer.write_all(&[ACK_OK])?,
        Ack::Warning(msg) => {
            writer.write_all(&[ACK_WARNING])?;
            writer.write_all(msg.as_bytes())?;
            writer.write_all(b"\n")?;
        }
        Ack::Fatal(msg) => {
            writer.write_all(&[ACK_FATAL])?;
            writer.write_all(msg.as_bytes())?;
            writer.write_all(b"\n")?;
        }
    }
    writer.flush()
}

/// Read one `\n`-terminated line, byte by byte so nothing past it is consumed.
pub fn read_line<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "control line too long"));
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn expect_ok<R: Read>(acks: &mut R, op: &'static str, path: &str) -> Result<()> {
    match read_ack(acks).map_err(|e| SyncError::transfer(op, path, e))? {
        Ack::Ok => Ok(()),
        Ack::Warning(msg) | Ack::Fatal(msg) => Err(SyncError::transfer(op, path, msg)),
    }
}

// =============================================================================
// Conversations
// =============================================================================

/// Send one file to a sink positioned in the target directory.
///
/// Exactly `len` bytes are taken from `content`; a short source is an error.
pub fn send_file<A, W, C>(acks: &mut A, out: &mut W, record: &Record, content: C) -> Result<u64>
where
    A: Read,
    W: Write,
    C: Read,
{
    let (len, name) = match record {
        Record::File { len, name, .. } => (*len, name.as_str()),
        _ => return Err(SyncError::transfer("upload", "", "not a file record")),
    };
    let io_err = |e: io::Error| SyncError::transfer("upload", name, e);

    expect_ok(acks, "upload", name)?;
    out.write_all(&record.encode()).map_err(io_err)?;
    out.flush().map_err(io_err)?;
    expect_ok(acks, "upload", name)?;

    let copied = io::copy(&mut content.take(len), out).map_err(io_err)?;
    if copied != len {
        return Err(SyncError::transfer(
            "upload",
            name,
            format!("source ended after {} of {} bytes", copied, len),
        ));
    }
    out.write_all(&[SENTINEL]).map_err(io_err)?;
    out.flush().map_err(io_err)?;
    expect_ok(acks, "upload", name)?;
    Ok(copied)
}

/// Create nested directories `segments[0]/segments[1]/...` below the sink's target.
pub fn send_dirs<A, W>(acks: &mut A, out: &mut W, segments: &[&str], mode: u32) -> Result<()>
where
    A: Read,
    W: Write,
{
    let path = segments.join("/");
    let io_err = |e: io::Error| SyncError::transfer("mkdir", path.as_str(), e);

    expect_ok(acks, "mkdir", &path)?;
    for segment in segments {
        out.write_all(&Record::dir(mode, *segment).encode()).map_err(io_err)?;
        out.flush().map_err(io_err)?;
        expect_ok(acks, "mkdir", &path)?;
    }
    for _ in segments {
        out.write_all(&Record::EndDir.encode()).map_err(io_err)?;
        out.flush().map_err(io_err)?;
        expect_ok(acks, "mkdir", &path)?;
    }
    Ok(())
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_records() {
        assert_eq!(
            Record::file(0o100644, 12, "c.txt").encode().as_ref(),
            b"C0644 12 c.txt\n"
        );
        assert_eq!(Record::dir(0o755, "a").encode().as_ref(), b"D0755 0 a\n");
        assert_eq!(Record::EndDir.encode().as_ref(), b"E\n");
    }

    #[test]
    fn test_parse_records() {
        assert_eq!(
            Record::parse("C0600 5 my file.txt\n").unwrap(),
            Record::file(0o600, 5, "my file.txt")
        );
        assert_eq!(Record::parse("D0755 0 lib").unwrap(), Record::dir(0o755, "lib"));
        assert_eq!(Record::parse("E").unwrap(), Record::EndDir);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        for line in ["", "X0644 1 a", "C0999 1 a", "C0644 x a", "C0644 1", "D0755 0 a/b", "D0755 0 ..", "Ex"] {
            assert!(Record::parse(line).is_err(), "accepted {:?}", line);
        }
    }

    #[test]
    fn test_read_ack_variants() {
        let mut input = Cursor::new(b"\x00\x01disk low\n\x02no such dir\n\x07".to_vec());
        assert_eq!(read_ack(&mut input).unwrap(), Ack::Ok);
        assert_eq!(read_ack(&mut input).unwrap(), Ack::Warning("disk low".into()));
        assert_eq!(read_ack(&mut input).unwrap(), Ack::Fatal("no such dir".into()));
        assert!(read_ack(&mut input).is_err());
        // truncated stream
        assert!(read_ack(&mut input).is_err());
    }

    #[test]
    fn test_write_ack() {
        let mut out = Vec::new();
        write_ack(&mut out, &Ack::Ok).unwrap();
        write_ack(&mut out, &Ack::Fatal("denied".into())).unwrap();
        assert_eq!(out, b"\x00\x02denied\n");
    }

    #[test]
    fn test_send_file_conversation() {
        let mut acks = Cursor::new(vec![0u8, 0, 0]);
        let mut out = Vec::new();
        let record = Record::file(0o644, 5, "c.txt");

        let sent = send_file(&mut acks, &mut out, &record, &b"hello world"[..]).unwrap();
        assert_eq!(sent, 5);
        assert_eq!(out, b"C0644 5 c.txt\nhello\x00");
    }

    #[test]
    fn test_send_file_short_source() {
        let mut acks = Cursor::new(vec![0u8, 0, 0]);
        let mut out = Vec::new();
        let record = Record::file(0o644, 10, "c.txt");
        let err = send_file(&mut acks, &mut out, &record, &b"abc"[..]).unwrap_err();
        assert!(err.to_string().contains("3 of 10 bytes"));
    }

    #[test]
    fn test_send_file_fatal_ack() {
        let mut acks = Cursor::new(b"\x00\x02scp: app: Permission denied\n".to_vec());
        let mut out = Vec::new();
        let record = Record::file(0o644, 1, "x");
        let err = send_file(&mut acks, &mut out, &record, &b"x"[..]).unwrap_err();
        assert!(err.to_string().contains("Permission denied"));
    }

    #[test]
    fn test_send_dirs_nests_and_closes() {
        let mut acks = Cursor::new(vec![0u8; 7]);
        let mut out = Vec::new();
        send_dirs(&mut acks, &mut out, &["a", "b", "c"], 0o755).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "D0755 0 a\nD0755 0 b\nD0755 0 c\nE\nE\nE\n"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("app/a b"), "'app/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
