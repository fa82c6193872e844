use std::collections::VecDeque;

/// The HPACK static table (RFC 7541 Appendix A), indices 1..=61.
pub(crate) const STATIC_TABLE: [(&str, &str); 61] = [
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

/// Per-entry overhead defined by RFC 7541 §4.1.
const ENTRY_OVERHEAD: usize = 32;

pub(crate) fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// The dynamic table: an insertion-ordered ring, newest first.
///
/// Index 1 addresses the newest entry *after* the static table range;
/// callers do the `static + dynamic` index arithmetic.
#[derive(Debug)]
pub(crate) struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(crate) fn new(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// `index` is 0-based from the newest entry.
    pub(crate) fn get(&self, index: usize) -> Option<(&str, &str)> {
        self.entries
            .get(index)
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Finds `(name, value)`, or failing that a name-only match;
    /// 0-based index from the newest entry.
    pub(crate) fn find(&self, name: &str, value: &str) -> (Option<usize>, Option<usize>) {
        let mut name_match = None;
        for (at, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return (Some(at), Some(at));
                }
                if name_match.is_none() {
                    name_match = Some(at);
                }
            }
        }
        (None, name_match)
    }

    /// Inserts at the newest end, evicting from the oldest end to fit.
    ///
    /// An entry larger than the whole table just empties it (RFC 7541
    /// §4.4).
    pub(crate) fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        while self.size + size > self.max_size && !self.entries.is_empty() {
            self.evict();
        }
        if size <= self.max_size {
            self.size += size;
            self.entries.push_front((name, value));
        }
    }

    /// Applies a new capacity, evicting until the table fits.
    pub(crate) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        while self.size > self.max_size {
            self.evict();
        }
    }

    fn evict(&mut self) {
        if let Some((name, value)) = self.entries.pop_back() {
            self.size -= entry_size(&name, &value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_well_known_entries() {
        assert_eq!(STATIC_TABLE[1], (":method", "GET"));
        assert_eq!(STATIC_TABLE[7], (":status", "200"));
        assert_eq!(STATIC_TABLE[60], ("www-authenticate", ""));
    }

    #[test]
    fn insert_and_index_newest_first() {
        let mut table = DynamicTable::new(4096);
        table.insert("a".into(), "1".into());
        table.insert("b".into(), "2".into());
        assert_eq!(table.get(0), Some(("b", "2")));
        assert_eq!(table.get(1), Some(("a", "1")));
    }

    #[test]
    fn eviction_is_oldest_first() {
        // Each "xN" entry is 2 + 32 = 34 bytes; cap fits two.
        let mut table = DynamicTable::new(68);
        table.insert("x".into(), "1".into());
        table.insert("x".into(), "2".into());
        table.insert("x".into(), "3".into());
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0), Some(("x", "3")));
        assert_eq!(table.get(1), Some(("x", "2")));
    }

    #[test]
    fn shrinking_capacity_evicts() {
        let mut table = DynamicTable::new(4096);
        table.insert("a".into(), "1".into());
        table.insert("b".into(), "2".into());
        table.set_max_size(34);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), Some(("b", "2")));
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = DynamicTable::new(40);
        table.insert("a".into(), "1".into());
        table.insert("huge".into(), "x".repeat(100));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn find_prefers_exact_match() {
        let mut table = DynamicTable::new(4096);
        table.insert("k".into(), "v1".into());
        table.insert("k".into(), "v2".into());
        let (exact, name_only) = table.find("k", "v1");
        assert_eq!(exact, Some(1));
        assert_eq!(name_only, Some(1));
        let (exact, name_only) = table.find("k", "v3");
        assert_eq!(exact, None);
        assert_eq!(name_only, Some(0));
    }
}
