//! Summary information property set (`\u{5}SummaryInformation`).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::error::{MsiError, Result};

pub const SUMMARY_INFO_STREAM: &str = "\u{5}SummaryInformation";
pub const FMTID_SUMMARY_INFORMATION: Uuid = Uuid::from_u128(0xF29F_85E0_4FF9_1068_AB91_0800_2B27_B3D9);

pub const PID_CODEPAGE: u32 = 1;
pub const PID_TITLE: u32 = 2;
pub const PID_SUBJECT: u32 = 3;
pub const PID_AUTHOR: u32 = 4;
pub const PID_KEYWORDS: u32 = 5;
pub const PID_COMMENTS: u32 = 6;
pub const PID_TEMPLATE: u32 = 7;
pub const PID_LASTAUTHOR: u32 = 8;
pub const PID_REVNUMBER: u32 = 9;
pub const PID_EDITTIME: u32 = 10;
pub const PID_LASTPRINTED: u32 = 11;
pub const PID_CREATE_DTM: u32 = 12;
pub const PID_LASTSAVE_DTM: u32 = 13;
pub const PID_PAGECOUNT: u32 = 14;
pub const PID_WORDCOUNT: u32 = 15;
pub const PID_CHARCOUNT: u32 = 16;
pub const PID_THUMBNAIL: u32 = 17;
pub const PID_APPNAME: u32 = 18;
pub const PID_SECURITY: u32 = 19;

pub const MAX_PROPERTY: u32 = 20;

const VT_I2: u32 = 2;
const VT_I4: u32 = 3;
const VT_LPSTR: u32 = 30;
const VT_FILETIME: u32 = 64;

/// 100ns ticks between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

const IDT_TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Short,
    Long,
    Text,
    FileTime,
}

/// Declared type of each property id; `None` for unsupported ids.
#[must_use]
pub const fn property_type(pid: u32) -> Option<PropertyType> {
    match pid {
        PID_CODEPAGE => Some(PropertyType::Short),
        PID_TITLE..=PID_REVNUMBER | PID_APPNAME => Some(PropertyType::Text),
        PID_EDITTIME..=PID_LASTSAVE_DTM => Some(PropertyType::FileTime),
        PID_PAGECOUNT..=PID_CHARCOUNT | PID_SECURITY => Some(PropertyType::Long),
        _ => None,
    }
}

/// Display name of a property id.
#[must_use]
pub const fn property_name(pid: u32) -> &'static str {
    match pid {
        PID_CODEPAGE => "Codepage",
        PID_TITLE => "Title",
        PID_SUBJECT => "Subject",
        PID_AUTHOR => "Author",
        PID_KEYWORDS => "Keywords",
        PID_COMMENTS => "Comments",
        PID_TEMPLATE => "Template",
        PID_LASTAUTHOR => "Last Saved By",
        PID_REVNUMBER => "Revision Number",
        PID_EDITTIME => "Edit Time",
        PID_LASTPRINTED => "Last Printed",
        PID_CREATE_DTM => "Create Time",
        PID_LASTSAVE_DTM => "Last Save Time",
        PID_PAGECOUNT => "Page Count",
        PID_WORDCOUNT => "Word Count",
        PID_CHARCOUNT => "Character Count",
        PID_THUMBNAIL => "Thumbnail",
        PID_APPNAME => "Creating Application",
        PID_SECURITY => "Security",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int(i32),
    Str(String),
    FileTime(DateTime<Utc>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::FileTime(t) => write!(f, "{}", t.format(IDT_TIME_FORMAT)),
        }
    }
}

#[must_use]
pub fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    let ticks = i64::try_from(ft).ok()? - FILETIME_UNIX_OFFSET;
    let secs = ticks.div_euclid(10_000_000);
    let nanos = (ticks.rem_euclid(10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[must_use]
pub fn datetime_to_filetime(dt: &DateTime<Utc>) -> u64 {
    let ticks = dt.timestamp() * 10_000_000 + i64::from(dt.timestamp_subsec_nanos() / 100);
    (ticks + FILETIME_UNIX_OFFSET).max(0) as u64
}

fn parse_idt_time(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text.trim(), IDT_TIME_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

/// Converts a value to the declared type of `pid`, if that is unambiguous.
fn coerce(pid: u32, value: PropertyValue) -> Option<PropertyValue> {
    let ty = property_type(pid)?;
    match (ty, value) {
        (PropertyType::Short | PropertyType::Long, PropertyValue::Int(i)) => Some(PropertyValue::Int(i)),
        (PropertyType::Short | PropertyType::Long, PropertyValue::Str(s)) => {
            s.trim().parse().ok().map(PropertyValue::Int)
        }
        (PropertyType::Text, PropertyValue::Str(s)) => Some(PropertyValue::Str(s)),
        (PropertyType::Text, PropertyValue::Int(i)) => Some(PropertyValue::Str(i.to_string())),
        (PropertyType::Text, v @ PropertyValue::FileTime(_)) => Some(PropertyValue::Str(v.to_string())),
        (PropertyType::FileTime, v @ PropertyValue::FileTime(_)) => Some(v),
        (PropertyType::FileTime, PropertyValue::Str(s)) => parse_idt_time(&s).map(PropertyValue::FileTime),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryInfo {
    properties: BTreeMap<u32, PropertyValue>,
}

struct Reader<'a> {
    data: &'a [u8],
}

impl Reader<'_> {
    fn bytes(&self, off: usize, len: usize) -> Result<&[u8]> {
        self.data
            .get(off..off + len)
            .ok_or_else(|| MsiError::InvalidData("summary information truncated".into()))
    }

    fn u16(&self, off: usize) -> Result<u16> {
        let b = self.bytes(off, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, off: usize) -> Result<u32> {
        let b = self.bytes(off, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, off: usize) -> Result<u64> {
        Ok(u64::from(self.u32(off)?) | (u64::from(self.u32(off + 4)?) << 32))
    }
}

impl SummaryInfo {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn property(&self, pid: u32) -> Option<&PropertyValue> {
        self.properties.get(&pid)
    }

    pub fn properties(&self) -> impl Iterator<Item = (u32, &PropertyValue)> {
        self.properties.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Sets a property; the value must match the declared type.
    pub fn set_property(&mut self, pid: u32, value: PropertyValue) -> Result<()> {
        let ty = property_type(pid).ok_or(MsiError::InvalidParameter)?;
        let ok = matches!(
            (ty, &value),
            (PropertyType::Short | PropertyType::Long, PropertyValue::Int(_))
                | (PropertyType::Text, PropertyValue::Str(_))
                | (PropertyType::FileTime, PropertyValue::FileTime(_))
        );
        if !ok {
            return Err(MsiError::DatatypeMismatch(format!("property {pid} expects {ty:?}")));
        }
        if let (PropertyType::Short, PropertyValue::Int(i)) = (ty, &value) {
            if i16::try_from(*i).is_err() {
                return Err(MsiError::DatatypeMismatch(format!("property {pid} is a 2-byte integer")));
            }
        }
        self.properties.insert(pid, value);
        Ok(())
    }

    pub fn remove_property(&mut self, pid: u32) -> Option<PropertyValue> {
        self.properties.remove(&pid)
    }

    /// Sets a property from its IDT text form, coercing to the declared type.
    pub fn set_from_text(&mut self, pid: u32, text: &str) -> Result<()> {
        let value = coerce(pid, PropertyValue::Str(text.to_string())).ok_or(MsiError::InvalidDatatype)?;
        self.set_property(pid, value)
    }

    /// Decodes a property-set stream. Entries that cannot be coerced to
    /// their declared type are dropped.
    pub fn load(data: &[u8]) -> Result<Self> {
        let r = Reader { data };
        if r.u16(0)? != 0xFFFE {
            return Err(MsiError::InvalidData("bad property set byte order".into()));
        }
        if r.u32(24)? < 1 {
            return Err(MsiError::InvalidData("property set has no sections".into()));
        }
        let fmtid = Uuid::from_slice_le(r.bytes(28, 16)?).map_err(|e| MsiError::InvalidData(e.to_string()))?;
        if fmtid != FMTID_SUMMARY_INFORMATION {
            return Err(MsiError::InvalidData("not a summary information stream".into()));
        }
        let section = r.u32(44)? as usize;
        let count = r.u32(section + 4)? as usize;

        let mut info = Self::new();
        for i in 0..count {
            let pid = r.u32(section + 8 + i * 8)?;
            let off = section + r.u32(section + 12 + i * 8)? as usize;
            let vt = r.u32(off)?;
            let raw = match vt {
                VT_I2 => PropertyValue::Int(i32::from(r.u16(off + 4)? as i16)),
                VT_I4 => PropertyValue::Int(r.u32(off + 4)? as i32),
                VT_LPSTR => {
                    let len = r.u32(off + 4)? as usize;
                    let bytes = r.bytes(off + 8, len)?;
                    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                    PropertyValue::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
                }
                VT_FILETIME => match filetime_to_datetime(r.u64(off + 4)?) {
                    Some(t) => PropertyValue::FileTime(t),
                    None => continue,
                },
                other => {
                    warn!(pid, vt = other, "skipping summary property of unsupported type");
                    continue;
                }
            };
            match coerce(pid, raw) {
                Some(v) => {
                    info.properties.insert(pid, v);
                }
                None => warn!(pid, "discarding summary property with mismatched type"),
            }
        }
        Ok(info)
    }

    /// Encodes the property set.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut values: Vec<(u32, Vec<u8>)> = Vec::with_capacity(self.properties.len());
        for (&pid, value) in &self.properties {
            let mut v = Vec::new();
            match (property_type(pid), value) {
                (Some(PropertyType::Short), PropertyValue::Int(i)) => {
                    v.extend_from_slice(&VT_I2.to_le_bytes());
                    v.extend_from_slice(&(*i as i16).to_le_bytes());
                    v.extend_from_slice(&[0, 0]);
                }
                (_, PropertyValue::Int(i)) => {
                    v.extend_from_slice(&VT_I4.to_le_bytes());
                    v.extend_from_slice(&i.to_le_bytes());
                }
                (_, PropertyValue::Str(s)) => {
                    v.extend_from_slice(&VT_LPSTR.to_le_bytes());
                    v.extend_from_slice(&(s.len() as u32 + 1).to_le_bytes());
                    v.extend_from_slice(s.as_bytes());
                    v.push(0);
                    while v.len() % 4 != 0 {
                        v.push(0);
                    }
                }
                (_, PropertyValue::FileTime(t)) => {
                    v.extend_from_slice(&VT_FILETIME.to_le_bytes());
                    v.extend_from_slice(&datetime_to_filetime(t).to_le_bytes());
                }
            }
            values.push((pid, v));
        }

        let header_len = 8 + values.len() * 8;
        let section_len = header_len + values.iter().map(|(_, v)| v.len()).sum::<usize>();

        let mut out = Vec::with_capacity(48 + section_len);
        out.extend_from_slice(&0xFFFEu16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x0002_0005u32.to_le_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&FMTID_SUMMARY_INFORMATION.to_bytes_le());
        out.extend_from_slice(&48u32.to_le_bytes());

        out.extend_from_slice(&(section_len as u32).to_le_bytes());
        out.extend_from_slice(&(values.len() as u32).to_le_bytes());
        let mut offset = header_len;
        for (pid, v) in &values {
            out.extend_from_slice(&pid.to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += v.len();
        }
        for (_, v) in values {
            out.extend_from_slice(&v);
        }
        out
    }
}
