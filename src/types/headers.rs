//! Types for HTTP headers

use smallvec::SmallVec;

/// An append-only header multimap. Lookups are case-insensitive; where a
/// single value is expected, the first-seen record wins.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    records: SmallVec<[Header; 32]>,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

impl Headers {
    /// Append a new header. Does not replace anything.
    pub fn append(&mut self, name: String, value: Vec<u8>) {
        self.records.push(Header { name, value });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// First-seen value for the given name
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| &h.value[..])
    }

    /// Returns true if we have this key/value combination
    pub fn has_kv(&self, k: &str, v: &str) -> bool {
        for h in self {
            if h.name.eq_ignore_ascii_case(k) && h.value.eq_ignore_ascii_case(v.as_bytes()) {
                return true;
            }
        }
        false
    }

    /// Returns true if we have a `connection: close` header
    pub fn connection_close(&self) -> bool {
        self.has_kv("connection", "close")
    }

    /// Returns true if we have a `connection: keep-alive` header
    pub fn connection_keep_alive(&self) -> bool {
        self.has_kv("connection", "keep-alive")
    }

    /// Returns true if we have a `transfer-encoding: chunked` header
    pub fn is_chunked_transfer_encoding(&self) -> bool {
        self.has_kv("transfer-encoding", "chunked")
    }

    /// The `content-length` header, parsed. `Some(Err(()))` means the header
    /// is present but its value isn't a decimal length — a semantic error the
    /// caller records.
    pub fn content_length(&self) -> Option<Result<u64, ()>> {
        let value = self.get("content-length")?;
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        Some(parsed.ok_or(()))
    }

    /// The `host` header as text, port stripped
    pub fn host(&self) -> Option<&str> {
        let value = self.get("host")?;
        let host = std::str::from_utf8(value).ok()?;
        Some(host.split(':').next().unwrap_or(host))
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
