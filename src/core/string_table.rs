//! Interned, reference-counted string pool.
//!
//! Every textual cell in the database is a [`StringId`] into this pool.
//! Id 0 is the empty/null string and is never allocated.
//!
//! Persisted as two streams: `_StringPool` holds 4-byte entries
//! (`u16 length`, `u16 refcount`) after a codepage header entry, and
//! `_StringData` holds the concatenated string bytes.

use tracing::warn;

use super::error::{MsiError, Result};

pub type StringId = u32;

pub const SHORT_STR_BYTES: usize = 2;
pub const LONG_STR_BYTES: usize = 3;

const LONG_REFS_FLAG: u16 = 0x8000;

/// Codepages accepted for `_ForceCodepage` and `set_codepage`.
const VALID_CODEPAGES: &[u32] = &[
    0, 37, 424, 437, 500, 737, 775, 850, 852, 855, 856, 857, 860, 861, 862, 863, 864, 865, 866,
    869, 874, 875, 878, 932, 936, 949, 950, 1006, 1026, 1250, 1251, 1252, 1253, 1254, 1255, 1256,
    1257, 1258, 1361, 10000, 10006, 10007, 10029, 10079, 10081, 20127, 20866, 20932, 21866, 28591,
    28592, 28593, 28594, 28595, 28596, 28597, 28598, 28599, 28600, 28603, 28604, 28605, 28606,
    65000, 65001,
];

#[must_use]
pub fn is_valid_codepage(codepage: u32) -> bool {
    VALID_CODEPAGES.contains(&codepage)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Referenced from a persistent row; written on commit.
    Persistent,
    /// Session-only reference (temporary rows, stream names).
    NonPersistent,
}

#[derive(Debug, Clone, Default)]
struct StringEntry {
    persistent_refcount: u32,
    nonpersistent_refcount: u32,
    data: Option<String>,
}

impl StringEntry {
    const fn is_free(&self) -> bool {
        self.persistent_refcount == 0 && self.nonpersistent_refcount == 0
    }
}

#[derive(Debug, Clone)]
pub struct StringTable {
    entries: Vec<StringEntry>,
    /// Ids of live entries ordered by string value.
    sorted: Vec<StringId>,
    free_slot: usize,
    codepage: u32,
    bytes_per_strref: usize,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new(0)
    }
}

impl StringTable {
    #[must_use]
    pub fn new(codepage: u32) -> Self {
        Self {
            entries: vec![StringEntry::default()],
            sorted: Vec::new(),
            free_slot: 1,
            codepage,
            bytes_per_strref: SHORT_STR_BYTES,
        }
    }

    #[must_use]
    pub const fn codepage(&self) -> u32 {
        self.codepage
    }

    pub fn set_codepage(&mut self, codepage: u32) -> Result<()> {
        if !is_valid_codepage(codepage) {
            return Err(MsiError::FunctionFailed(format!("unsupported codepage {codepage}")));
        }
        self.codepage = codepage;
        Ok(())
    }

    /// Width of string references in table streams as of the last load or save.
    #[must_use]
    pub const fn bytes_per_strref(&self) -> usize {
        self.bytes_per_strref
    }

    /// Number of id slots, including the reserved id 0.
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of live strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    fn find_sorted(&self, text: &str) -> std::result::Result<usize, usize> {
        self.sorted.binary_search_by(|&id| {
            self.entries[id as usize].data.as_deref().unwrap_or("").cmp(text)
        })
    }

    /// Id of an existing string, without touching reference counts.
    #[must_use]
    pub fn id_of(&self, text: &str) -> Option<StringId> {
        if text.is_empty() {
            return Some(0);
        }
        self.find_sorted(text).ok().map(|pos| self.sorted[pos])
    }

    /// Text for an id; `None` for id 0 and for free slots.
    #[must_use]
    pub fn lookup(&self, id: StringId) -> Option<&str> {
        if id == 0 {
            return None;
        }
        let entry = self.entries.get(id as usize)?;
        if entry.is_free() {
            return None;
        }
        entry.data.as_deref()
    }

    #[must_use]
    pub fn refcounts(&self, id: StringId) -> (u32, u32) {
        self.entries
            .get(id as usize)
            .map_or((0, 0), |e| (e.persistent_refcount, e.nonpersistent_refcount))
    }

    /// Interns `text` with one reference.
    pub fn add(&mut self, text: &str, persistence: Persistence) -> StringId {
        self.add_with_refs(text, 1, persistence)
    }

    pub fn add_with_refs(&mut self, text: &str, refcount: u32, persistence: Persistence) -> StringId {
        if text.is_empty() {
            return 0;
        }
        if let Ok(pos) = self.find_sorted(text) {
            let id = self.sorted[pos];
            let entry = &mut self.entries[id as usize];
            match persistence {
                Persistence::Persistent => entry.persistent_refcount += refcount,
                Persistence::NonPersistent => entry.nonpersistent_refcount += refcount,
            }
            return id;
        }

        let id = self.find_free_slot();
        let entry = &mut self.entries[id];
        entry.data = Some(text.to_string());
        match persistence {
            Persistence::Persistent => entry.persistent_refcount = refcount.max(1),
            Persistence::NonPersistent => entry.nonpersistent_refcount = refcount.max(1),
        }
        self.insert_sorted(id as StringId);
        id as StringId
    }

    /// Drops one reference to `id`. Once no reference of either kind is
    /// left the slot becomes a hole and its id can be handed out again.
    pub fn release(&mut self, id: StringId, persistence: Persistence) {
        let Some(entry) = self.entries.get_mut(id as usize) else {
            return;
        };
        if id == 0 || entry.is_free() {
            return;
        }
        let (own, other) = match persistence {
            Persistence::Persistent => (&mut entry.persistent_refcount, &mut entry.nonpersistent_refcount),
            Persistence::NonPersistent => (&mut entry.nonpersistent_refcount, &mut entry.persistent_refcount),
        };
        // a row may have changed persistence since the reference was taken
        if *own > 0 {
            *own -= 1;
        } else {
            *other -= 1;
        }
        if !entry.is_free() {
            return;
        }

        let text = entry.data.clone().unwrap_or_default();
        if let Ok(pos) = self.find_sorted(&text) {
            self.sorted.remove(pos);
        }
        self.entries[id as usize].data = None;
        self.free_slot = self.free_slot.min(id as usize);
    }

    fn find_free_slot(&mut self) -> usize {
        let start = self.free_slot.max(1);
        let found = (start..self.entries.len())
            .chain(1..start.min(self.entries.len()))
            .find(|&i| self.entries[i].is_free());
        let slot = found.unwrap_or_else(|| {
            self.entries.push(StringEntry::default());
            self.entries.len() - 1
        });
        self.free_slot = slot + 1;
        slot
    }

    fn insert_sorted(&mut self, id: StringId) {
        let text = self.entries[id as usize].data.as_deref().unwrap_or("");
        let pos = match self.find_sorted(text) {
            Ok(p) | Err(p) => p,
        };
        self.sorted.insert(pos, id);
    }

    /// Decodes `_StringPool` / `_StringData`.
    pub fn load(pool: &[u8], data: &[u8]) -> Result<Self> {
        if pool.is_empty() {
            return Ok(Self::new(0));
        }
        if pool.len() % 4 != 0 {
            warn!(len = pool.len(), "string pool size is not a multiple of 4");
        }
        let words: Vec<u16> = pool
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let count = words.len() / 2;
        if count == 0 {
            return Err(MsiError::InvalidData("string pool header truncated".into()));
        }

        let codepage = u32::from(words[0]) | (u32::from(words[1] & !LONG_REFS_FLAG) << 16);
        let long_refs = words[1] & LONG_REFS_FLAG != 0;

        let mut st = Self::new(codepage);
        st.bytes_per_strref = if long_refs { LONG_STR_BYTES } else { SHORT_STR_BYTES };
        st.entries.reserve(count);

        let mut i = 1;
        let mut offset = 0usize;
        while i < count {
            let len = words[i * 2];
            let refs = words[i * 2 + 1];

            if len == 0 && refs == 0 {
                st.entries.push(StringEntry::default());
                i += 1;
                continue;
            }

            let (len, refs) = if len == 0 {
                // continuation marker: refcount slot holds the high half of the length
                if i + 1 >= count {
                    warn!(entry = i, "long string entry truncated");
                    break;
                }
                let low = words[(i + 1) * 2];
                let real_refs = words[(i + 1) * 2 + 1];
                i += 2;
                ((usize::from(refs) << 16) | usize::from(low), real_refs)
            } else {
                i += 1;
                (usize::from(len), refs)
            };

            if offset + len > data.len() {
                warn!(offset, len, size = data.len(), "string data truncated");
                break;
            }
            let text = String::from_utf8_lossy(&data[offset..offset + len]).into_owned();
            offset += len;

            st.entries.push(StringEntry {
                persistent_refcount: u32::from(refs),
                nonpersistent_refcount: 0,
                data: (refs != 0).then_some(text),
            });
        }

        st.sorted = (1..st.entries.len())
            .filter(|&i| !st.entries[i].is_free())
            .map(|i| i as StringId)
            .collect();
        let entries = &st.entries;
        st.sorted
            .sort_by(|&a, &b| entries[a as usize].data.cmp(&entries[b as usize].data));
        st.free_slot = 1;
        Ok(st)
    }

    /// Encodes the persistent strings; returns `(pool, data, bytes_per_strref)`.
    ///
    /// Strings only referenced from temporary rows are written as holes so
    /// that every persistent id keeps its slot.
    pub fn save(&mut self) -> (Vec<u8>, Vec<u8>, usize) {
        let long_refs = self.entries.len() > 0xFFFF;
        let mut pool = Vec::with_capacity(self.entries.len() * 4);
        let mut data = Vec::new();

        let push = |pool: &mut Vec<u8>, a: u16, b: u16| {
            pool.extend_from_slice(&a.to_le_bytes());
            pool.extend_from_slice(&b.to_le_bytes());
        };

        let mut high = ((self.codepage >> 16) as u16) & !LONG_REFS_FLAG;
        if long_refs {
            high |= LONG_REFS_FLAG;
        }
        push(&mut pool, (self.codepage & 0xFFFF) as u16, high);

        for entry in self.entries.iter().skip(1) {
            let text = match entry.data.as_deref() {
                Some(t) if entry.persistent_refcount > 0 && !t.is_empty() => t,
                _ => {
                    push(&mut pool, 0, 0);
                    continue;
                }
            };
            let len = text.len();
            let refs = entry.persistent_refcount.min(0xFFFF) as u16;
            if len <= 0xFFFF {
                push(&mut pool, len as u16, refs);
            } else {
                push(&mut pool, 0, (len >> 16) as u16);
                push(&mut pool, (len & 0xFFFF) as u16, refs);
            }
            data.extend_from_slice(text.as_bytes());
        }

        self.bytes_per_strref = if long_refs { LONG_STR_BYTES } else { SHORT_STR_BYTES };
        (pool, data, self.bytes_per_strref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dedups_and_counts() {
        let mut st = StringTable::new(0);
        let a = st.add("alpha", Persistence::Persistent);
        let b = st.add("beta", Persistence::Persistent);
        let a2 = st.add("alpha", Persistence::NonPersistent);
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(st.refcounts(a), (1, 1));
        assert_eq!(st.lookup(a), Some("alpha"));
        assert_eq!(st.id_of("beta"), Some(b));
        assert_eq!(st.id_of("gamma"), None);
        assert_eq!(st.len(), 2);
    }

    #[test]
    fn test_empty_string_is_id_zero() {
        let mut st = StringTable::new(0);
        assert_eq!(st.add("", Persistence::Persistent), 0);
        assert_eq!(st.refcounts(0), (0, 0));
        assert_eq!(st.lookup(0), None);
        assert_eq!(st.lookup(77), None);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut st = StringTable::new(1252);
        let words = ["zeta", "alpha", "mid", "alpha", "Zebra"];
        let ids: Vec<_> = words.iter().map(|w| st.add(w, Persistence::Persistent)).collect();
        let temp = st.add("session only", Persistence::NonPersistent);

        let (pool, data, width) = st.save();
        assert_eq!(width, SHORT_STR_BYTES);

        let loaded = StringTable::load(&pool, &data).unwrap();
        assert_eq!(loaded.codepage(), 1252);
        for (w, id) in words.iter().zip(&ids) {
            assert_eq!(loaded.lookup(*id), Some(*w));
            assert_eq!(loaded.refcounts(*id).0, st.refcounts(*id).0);
        }
        assert_eq!(loaded.lookup(temp), None);
        assert_eq!(loaded.id_of("alpha"), Some(ids[1]));
    }

    #[test]
    fn test_hole_slot_is_reused() {
        let mut st = StringTable::new(0);
        st.add("keep", Persistence::Persistent);
        let gone = st.add("gone", Persistence::NonPersistent);
        st.add("last", Persistence::Persistent);
        let (pool, data, _) = st.save();

        let mut loaded = StringTable::load(&pool, &data).unwrap();
        assert_eq!(loaded.lookup(gone), None);
        assert_eq!(loaded.add("fresh", Persistence::Persistent), gone);
    }

    #[test]
    fn test_release_frees_slot() {
        let mut st = StringTable::new(0);
        let shared = st.add("shared", Persistence::Persistent);
        st.add("shared", Persistence::NonPersistent);
        let ghost = st.add("ghost", Persistence::Persistent);
        let tail = st.add("tail", Persistence::Persistent);

        st.release(ghost, Persistence::Persistent);
        assert_eq!(st.lookup(ghost), None);
        assert_eq!(st.id_of("ghost"), None);
        assert_eq!(st.refcounts(ghost), (0, 0));

        st.release(shared, Persistence::Persistent);
        assert_eq!(st.refcounts(shared), (0, 1));
        assert_eq!(st.lookup(shared), Some("shared"));
        assert_eq!(st.id_of("tail"), Some(tail));

        let (pool, data, _) = st.save();
        let mut loaded = StringTable::load(&pool, &data).unwrap();
        assert_eq!(loaded.id_of("ghost"), None);
        assert_eq!(loaded.id_of("shared"), None);
        assert_eq!(loaded.lookup(tail), Some("tail"));
        assert_eq!(loaded.add("reborn", Persistence::Persistent), shared);
    }

    #[test]
    fn test_release_ignores_free_ids() {
        let mut st = StringTable::new(0);
        let id = st.add("once", Persistence::NonPersistent);
        st.release(id, Persistence::NonPersistent);
        st.release(id, Persistence::NonPersistent);
        st.release(0, Persistence::Persistent);
        st.release(99, Persistence::Persistent);
        assert!(st.is_empty());
        assert_eq!(st.add("again", Persistence::Persistent), id);
    }

    #[test]
    fn test_long_string_uses_two_pool_entries() {
        let mut st = StringTable::new(0);
        let big = "x".repeat(70_000);
        let a = st.add(&big, Persistence::Persistent);
        let b = st.add("after", Persistence::Persistent);
        let (pool, data, _) = st.save();

        // header + two entries for the long string + one for "after"
        assert_eq!(pool.len(), 4 * 4);
        assert_eq!(&pool[4..6], &[0, 0]);
        assert_eq!(u16::from_le_bytes([pool[6], pool[7]]), (70_000 >> 16) as u16);

        let loaded = StringTable::load(&pool, &data).unwrap();
        assert_eq!(loaded.lookup(a).map(str::len), Some(70_000));
        assert_eq!(loaded.lookup(b), Some("after"));
    }

    #[test]
    fn test_long_refs_flag() {
        let mut st = StringTable::new(0);
        for i in 0..70_000 {
            st.add(&format!("s{i:06}"), Persistence::Persistent);
        }
        let (pool, data, width) = st.save();
        assert_eq!(width, LONG_STR_BYTES);
        assert_ne!(pool[3] & 0x80, 0);
        let loaded = StringTable::load(&pool, &data).unwrap();
        assert_eq!(loaded.bytes_per_strref(), LONG_STR_BYTES);
        assert_eq!(loaded.codepage(), 0);
        assert_eq!(loaded.id_of("s069999"), st.id_of("s069999"));
    }

    #[test]
    fn test_codepage_validation() {
        let mut st = StringTable::new(0);
        assert!(st.set_codepage(1252).is_ok());
        assert!(st.set_codepage(12345).is_err());
        assert_eq!(st.codepage(), 1252);
    }
}
