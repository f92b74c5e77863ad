use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::PeerAddr;

/// Hard cap on a single wire frame. Anything longer is treated as malformed.
pub const MAX_FRAME_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed {kind} record: {text:?}")]
    MalformedFrame { kind: &'static str, text: String },
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    FrameTooLong,
}

impl WireError {
    pub(crate) fn malformed(kind: &'static str, text: impl Into<String>) -> Self {
        Self::MalformedFrame {
            kind,
            text: text.into(),
        }
    }
}

/// True when `name` can travel in a record without corrupting the framing
/// and cannot escape a node's file directories.
pub(crate) fn valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ',', ';'])
        && !name.contains(char::is_whitespace)
}

/// File metadata carried by every protocol message.
///
/// `origin` is the leaf that authoritatively owns the file. `valid` only
/// participates in the pull consistency model and is omitted from the text
/// form when absent, so parse/format round-trips are byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub origin: PeerAddr,
    pub version: u64,
    pub valid: Option<bool>,
}

impl FileInfo {
    /// Metadata for a file this node just became the origin of.
    pub fn owned(name: impl Into<String>, origin: PeerAddr) -> Self {
        Self {
            name: name.into(),
            origin,
            version: 1,
            valid: Some(true),
        }
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.name, self.origin, self.version)?;
        if let Some(valid) = self.valid {
            write!(f, ",{valid}")?;
        }
        Ok(())
    }
}

impl FromStr for FileInfo {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(WireError::malformed("file-info", s));
        }
        if !valid_file_name(fields[0]) {
            return Err(WireError::malformed("file-info", s));
        }
        let origin: PeerAddr = fields[1]
            .parse()
            .map_err(|_| WireError::malformed("file-info", s))?;
        let version: u64 = fields[2]
            .parse()
            .map_err(|_| WireError::malformed("file-info", s))?;
        let valid = match fields.get(3) {
            None => None,
            Some(raw) => Some(
                raw.parse::<bool>()
                    .map_err(|_| WireError::malformed("file-info", s))?,
            ),
        };
        Ok(Self {
            name: fields[0].to_owned(),
            origin,
            version,
            valid,
        })
    }
}

/// A flooded protocol message: `id;ttl;fileinfo;sender`.
///
/// `id` is unique per originating leaf (`<origin_addr>-<sequence>`). `sender`
/// is the last hop that transmitted the message and is rewritten by every
/// forwarding super-peer; it is distinct from `file.origin`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub ttl: u32,
    pub file: FileInfo,
    pub sender: PeerAddr,
}

impl Message {
    /// A message that never floods (register/deregister on the persistent
    /// super-peer session); id and ttl carry placeholder values.
    pub fn plain(file: FileInfo, sender: PeerAddr) -> Self {
        Self {
            id: "0".to_owned(),
            ttl: 0,
            file,
            sender,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{};{};{}", self.id, self.ttl, self.file, self.sender)
    }
}

impl FromStr for Message {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(';').collect();
        if fields.len() != 4 || fields[0].is_empty() {
            return Err(WireError::malformed("message", s));
        }
        let ttl: u32 = fields[1]
            .parse()
            .map_err(|_| WireError::malformed("message", s))?;
        let file: FileInfo = fields[2].parse()?;
        let sender: PeerAddr = fields[3]
            .parse()
            .map_err(|_| WireError::malformed("message", s))?;
        Ok(Self {
            id: fields[0].to_owned(),
            ttl,
            file,
            sender,
        })
    }
}

/// Verdict returned by an origin leaf to a `status` probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusVerdict {
    Deleted,
    UpToDate,
    Outdated,
}

impl StatusVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::UpToDate => "uptodate",
            Self::Outdated => "outdated",
        }
    }
}

impl fmt::Display for StatusVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusVerdict {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deleted" => Ok(Self::Deleted),
            "uptodate" => Ok(Self::UpToDate),
            "outdated" => Ok(Self::Outdated),
            other => Err(WireError::malformed("status-verdict", other)),
        }
    }
}

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register(Message),
    Deregister(Message),
    Query(Message),
    QueryHit(Message, PeerAddr),
    Invalidate(Message),
    Obtain(Message),
    Status(FileInfo),
}

impl Frame {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::Deregister(_) => "deregister",
            Self::Query(_) => "query",
            Self::QueryHit(..) => "queryhit",
            Self::Invalidate(_) => "invalidate",
            Self::Obtain(_) => "obtain",
            Self::Status(_) => "status",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(m)
            | Self::Deregister(m)
            | Self::Query(m)
            | Self::Invalidate(m)
            | Self::Obtain(m) => write!(f, "{} {m}", self.command()),
            Self::QueryHit(m, holder) => write!(f, "queryhit {m} {holder}"),
            Self::Status(info) => write!(f, "status {info}"),
        }
    }
}

impl FromStr for Frame {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        match tokens.as_slice() {
            ["register", body] => Ok(Self::Register(body.parse()?)),
            ["deregister", body] => Ok(Self::Deregister(body.parse()?)),
            ["query", body] => Ok(Self::Query(body.parse()?)),
            ["queryhit", body, holder] => Ok(Self::QueryHit(
                body.parse()?,
                holder
                    .parse()
                    .map_err(|_| WireError::malformed("queryhit", s))?,
            )),
            ["invalidate", body] => Ok(Self::Invalidate(body.parse()?)),
            ["obtain", body] => Ok(Self::Obtain(body.parse()?)),
            ["status", body] => Ok(Self::Status(body.parse()?)),
            _ => Err(WireError::malformed("frame", s)),
        }
    }
}

/// Read one newline-terminated frame, enforcing [`MAX_FRAME_BYTES`].
///
/// Returns `Ok(None)` on a clean EOF between frames; EOF in the middle of a
/// frame is an error. A trailing `\r` is stripped for tolerance.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let (found, used) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("connection closed mid-frame");
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&chunk[..pos]);
                    (true, pos + 1)
                }
                None => {
                    buf.extend_from_slice(chunk);
                    (false, chunk.len())
                }
            }
        };
        reader.consume(used);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLong.into());
        }
        if found {
            let mut text = String::from_utf8(buf)
                .map_err(|err| WireError::malformed("frame", err.to_string()))?;
            if text.ends_with('\r') {
                text.pop();
            }
            return Ok(Some(text));
        }
    }
}

/// Write one frame line followed by `\n`.
pub async fn write_frame<W>(writer: &mut W, frame: &str) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLong.into());
    }
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
