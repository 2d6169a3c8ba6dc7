use anyhow::{Result, anyhow, bail};
use std::fmt;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use url::{Host, Url};

/// Maximum total size of the request line plus headers (64 KiB)
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

const PROXY_AUTHORIZATION: &str = "proxy-authorization";

/// RequestLine is the parsed first line of a proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    /// parse splits `METHOD target VERSION`; all three must be present
    pub fn parse(line: &[u8]) -> Option<Self> {
        let line = std::str::from_utf8(line).ok()?;
        let mut parts = line.split_whitespace();
        let (method, target, version) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Headers keeps one value per header name. Names compare
/// case-insensitively; a repeated header replaces the earlier value.
/// Values are kept as raw bytes and forwarded unchanged.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<u8>)>,
}

impl Headers {
    pub fn insert(&mut self, name: &str, value: &[u8]) {
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => *entry = (name.to_string(), value.to_vec()),
            None => self.entries.push((name.to_string(), value.to_vec())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_slice())
    }

    /// proxy_authorization is the credential header, if it is valid UTF-8
    pub fn proxy_authorization(&self) -> Option<&str> {
        self.get(PROXY_AUTHORIZATION)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// write_forwarded appends every header except Proxy-Authorization
    pub fn write_forwarded(&self, out: &mut Vec<u8>) {
        for (name, value) in self.iter() {
            if !name.eq_ignore_ascii_case(PROXY_AUTHORIZATION) {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
        }
    }
}

/// parse_header_line splits `Name: value` on the first colon. The name
/// must be ASCII; the value may carry any bytes.
pub fn parse_header_line(line: &[u8]) -> Option<(&str, &[u8])> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = line[..colon].trim_ascii();
    if name.is_empty() || !name.is_ascii() {
        return None;
    }
    let name = std::str::from_utf8(name).ok()?;
    Some((name, line[colon + 1..].trim_ascii()))
}

/// ForwardTarget is where a plain (non-CONNECT) request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host: String,
    pub port: u16,
    /// First line with the absolute URI replaced by path and query
    pub request_line: String,
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// parse_absolute_uri resolves the origin server of a forward-proxy
/// request. The port defaults to 443 for https and 80 otherwise.
pub fn parse_absolute_uri(request: &RequestLine) -> Result<ForwardTarget> {
    let url = Url::parse(&request.target)
        .map_err(|e| anyhow!("url parse error for {:?}: {e}", request.target))?;

    let host = match url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        _ => bail!("no host in {:?}", request.target),
    };

    let default_port = if url.scheme() == "https" { 443 } else { 80 };
    let port = url.port().unwrap_or(default_port);

    Ok(ForwardTarget {
        host,
        port,
        request_line: format!(
            "{} {} {}",
            request.method,
            origin_form(&request.target),
            request.version
        ),
    })
}

/// origin_form is the path and query of an absolute URI exactly as the
/// client wrote them, without the fragment. An empty path becomes `/`.
fn origin_form(target: &str) -> String {
    let authority_start = match target.find("://") {
        Some(i) => i + 3,
        None => target.find(':').map_or(0, |i| i + 1),
    };
    let after_authority = &target[authority_start..];
    let rest = after_authority
        .find(['/', '?', '#'])
        .map_or("", |i| &after_authority[i..]);
    let rest = rest.split('#').next().unwrap_or_default();

    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    }
}

/// read_line reads one `\n`-terminated line, charging its length to
/// `budget`. The line is returned without its line ending.
pub async fn read_line<R>(reader: &mut R, budget: &mut usize) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut buf)
        .await?;

    if !buf.ends_with(b"\n") {
        return Err(if n == *budget {
            io::Error::new(io::ErrorKind::InvalidData, "request header too large")
        } else {
            io::Error::from(io::ErrorKind::UnexpectedEof)
        });
    }
    *budget -= n;

    while buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        buf.pop();
    }
    Ok(buf)
}

/// read_headers consumes header lines up to and including the blank line
pub async fn read_headers<R>(reader: &mut R, budget: &mut usize) -> io::Result<Headers>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::default();
    loop {
        let line = read_line(reader, budget).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = parse_header_line(&line).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed header line {:?}", String::from_utf8_lossy(&line)),
            )
        })?;
        headers.insert(name, value);
    }
}
