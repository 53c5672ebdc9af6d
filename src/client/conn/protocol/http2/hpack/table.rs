//! Static and dynamic header tables (RFC 7541 Section 2.3).

use std::collections::VecDeque;

use bytes::Bytes;

use super::{HeaderField, HpackError};

/// RFC 7541 Appendix A, indices 1 through 61.
const STATIC: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

pub(super) const STATIC_LEN: usize = STATIC.len();

/// How a header matched the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Match {
    /// Name and value both matched at this index.
    Full(usize),
    /// Only the name matched at this index.
    Name(usize),
}

/// The combined index space: static entries first, then the dynamic
/// table newest-first.
#[derive(Debug)]
pub(super) struct Table {
    dynamic: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl Table {
    pub(super) fn new(max_size: usize) -> Self {
        Self {
            dynamic: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(super) fn max_size(&self) -> usize {
        self.max_size
    }

    #[cfg(test)]
    pub(super) fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    pub(super) fn dynamic_len(&self) -> usize {
        self.dynamic.len()
    }

    pub(super) fn get(&self, index: usize) -> Result<HeaderField, HpackError> {
        match index {
            0 => Err(HpackError::InvalidIndex(index)),
            1..=STATIC_LEN => {
                let (name, value) = STATIC[index - 1];
                Ok(HeaderField::new(
                    Bytes::from_static(name.as_bytes()),
                    Bytes::from_static(value.as_bytes()),
                ))
            }
            _ => self
                .dynamic
                .get(index - STATIC_LEN - 1)
                .cloned()
                .ok_or(HpackError::InvalidIndex(index)),
        }
    }

    pub(super) fn find(&self, name: &[u8], value: &[u8]) -> Option<Match> {
        let mut name_match = None;

        for (i, (n, v)) in STATIC.iter().enumerate() {
            if n.as_bytes() == name {
                if v.as_bytes() == value {
                    return Some(Match::Full(i + 1));
                }
                name_match.get_or_insert(i + 1);
            }
        }

        for (i, field) in self.dynamic.iter().enumerate() {
            if field.name == name {
                let index = STATIC_LEN + 1 + i;
                if field.value == value {
                    return Some(Match::Full(index));
                }
                name_match.get_or_insert(index);
            }
        }

        name_match.map(Match::Name)
    }

    pub(super) fn insert(&mut self, field: HeaderField) {
        let size = field.size();
        if size > self.max_size {
            // An entry larger than the table empties it (RFC 7541 Section 4.4).
            self.dynamic.clear();
            self.size = 0;
            return;
        }

        self.evict_to(self.max_size - size);
        self.size += size;
        self.dynamic.push_front(field);
    }

    pub(super) fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, target: usize) {
        while self.size > target {
            match self.dynamic.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        HeaderField::new(
            Bytes::from_static(name.as_bytes()),
            Bytes::from_static(value.as_bytes()),
        )
    }

    #[test]
    fn static_lookup() {
        let table = Table::new(4096);
        assert_eq!(table.get(2).unwrap(), field(":method", "GET"));
        assert_eq!(table.get(61).unwrap(), field("www-authenticate", ""));
        assert!(table.get(0).is_err());
        assert!(table.get(62).is_err());
        assert_eq!(table.find(b":status", b"404"), Some(Match::Full(13)));
        assert_eq!(table.find(b":status", b"418"), Some(Match::Name(8)));
        assert_eq!(table.find(b"x-custom", b"1"), None);
    }

    #[test]
    fn dynamic_entries_are_newest_first() {
        let mut table = Table::new(4096);
        table.insert(field("a", "1"));
        table.insert(field("b", "2"));
        assert_eq!(table.get(62).unwrap(), field("b", "2"));
        assert_eq!(table.get(63).unwrap(), field("a", "1"));
        assert_eq!(table.find(b"a", b"1"), Some(Match::Full(63)));
        assert_eq!(table.size(), 2 * 34);
    }

    #[test]
    fn eviction_drops_oldest() {
        // Each entry is 34 bytes; room for two.
        let mut table = Table::new(70);
        table.insert(field("a", "1"));
        table.insert(field("b", "2"));
        table.insert(field("c", "3"));
        assert_eq!(table.dynamic_len(), 2);
        assert_eq!(table.get(63).unwrap(), field("b", "2"));

        table.resize(34);
        assert_eq!(table.dynamic_len(), 1);
        table.resize(0);
        assert_eq!(table.dynamic_len(), 0);
    }

    #[test]
    fn oversized_entry_clears() {
        let mut table = Table::new(40);
        table.insert(field("a", "1"));
        table.insert(field("long-name", "long-value"));
        assert_eq!(table.dynamic_len(), 0);
        assert_eq!(table.size(), 0);
    }
}
