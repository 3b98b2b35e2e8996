use super::error::{MsiError, Result};

pub const MSITYPE_VALID: u32 = 0x0100;
pub const MSITYPE_LOCALIZABLE: u32 = 0x0200;
/// Set on 2-byte integer and sized string columns by the native tools.
pub const MSITYPE_NONBINARY: u32 = 0x0400;
pub const MSITYPE_STRING: u32 = 0x0800;
pub const MSITYPE_NULLABLE: u32 = 0x1000;
pub const MSITYPE_KEY: u32 = 0x2000;
pub const MSITYPE_TEMPORARY: u32 = 0x4000;
pub const MSITYPE_UNKNOWN: u32 = 0x8000;
pub const MSITYPE_WIDTH_MASK: u32 = 0x00FF;

/// Most columns a table can hold.
pub const MAX_COLUMNS: usize = 32;

/// Type of a 2-byte integer column (`i2`).
pub const TYPE_SHORT: u32 = MSITYPE_VALID | MSITYPE_NONBINARY | 2;
/// Type of a 4-byte integer column (`i4`).
pub const TYPE_LONG: u32 = MSITYPE_VALID | 4;
/// Type of a binary stream column (`v0`).
pub const TYPE_BINARY: u32 = MSITYPE_VALID | MSITYPE_STRING;

#[must_use]
pub const fn type_string(width: u32) -> u32 {
    MSITYPE_VALID | MSITYPE_NONBINARY | MSITYPE_STRING | (width & MSITYPE_WIDTH_MASK)
}

#[must_use]
pub const fn is_binary(ty: u32) -> bool {
    (ty & !(MSITYPE_NULLABLE | MSITYPE_KEY | MSITYPE_TEMPORARY)) == (MSITYPE_STRING | MSITYPE_VALID)
}

#[must_use]
pub const fn is_string(ty: u32) -> bool {
    ty & MSITYPE_STRING != 0 && !is_binary(ty)
}

#[must_use]
pub const fn is_key(ty: u32) -> bool {
    ty & MSITYPE_KEY != 0
}

#[must_use]
pub const fn is_nullable(ty: u32) -> bool {
    ty & MSITYPE_NULLABLE != 0
}

/// Width of an integer column in bytes (2 or 4).
#[must_use]
pub const fn int_width(ty: u32) -> usize {
    if (ty & MSITYPE_WIDTH_MASK) <= 2 { 2 } else { 4 }
}

/// Bytes a column occupies in a table stream.
#[must_use]
pub const fn bytes_per_column(ty: u32, bytes_per_strref: usize) -> usize {
    if is_binary(ty) {
        2
    } else if ty & MSITYPE_STRING != 0 {
        bytes_per_strref
    } else {
        int_width(ty)
    }
}

/// Encodes a signed integer for a column of `width` bytes so that the
/// stored value is never 0 (0 means NULL).
pub fn bias_encode(value: i32, width: usize) -> Result<u32> {
    if width == 2 {
        let v = i64::from(value) + 0x8000;
        if !(0..=0xFFFF).contains(&v) {
            return Err(MsiError::FunctionFailed(format!("value {value} out of range for a 2-byte column")));
        }
        Ok(v as u32)
    } else {
        Ok((value as u32) ^ 0x8000_0000)
    }
}

/// Inverse of [`bias_encode`]; a stored 0 is NULL.
#[must_use]
pub const fn bias_decode(raw: u32, width: usize) -> Option<i32> {
    if raw == 0 {
        return None;
    }
    if width == 2 {
        Some(raw as i32 - 0x8000)
    } else {
        Some((raw ^ 0x8000_0000) as i32)
    }
}

/// IDT type code for a column type word (`s72`, `I2`, `v0`, ...).
#[must_use]
pub fn type_code(ty: u32, temporary: bool) -> String {
    let mut c = if is_binary(ty) {
        'v'
    } else if ty & MSITYPE_LOCALIZABLE != 0 {
        'l'
    } else if ty & MSITYPE_UNKNOWN != 0 {
        'f'
    } else if ty & MSITYPE_STRING != 0 {
        if temporary { 'g' } else { 's' }
    } else if temporary {
        'j'
    } else {
        'i'
    };
    if ty & MSITYPE_NULLABLE != 0 {
        c = c.to_ascii_uppercase();
    }
    format!("{c}{}", ty & MSITYPE_WIDTH_MASK)
}

/// Parses an IDT type code into a column type word (without the key bit).
pub fn parse_type_code(code: &str) -> Result<u32> {
    let mut chars = code.chars();
    let kind = chars.next().ok_or(MsiError::InvalidDatatype)?;
    let rest = chars.as_str();
    let width: u32 = if rest.is_empty() {
        0
    } else {
        rest.parse().map_err(|_| MsiError::InvalidDatatype)?
    };
    let nullable = if kind.is_ascii_uppercase() { MSITYPE_NULLABLE } else { 0 };
    let ty = match kind.to_ascii_lowercase() {
        's' | 'g' => type_string(width),
        'l' => type_string(width) | MSITYPE_LOCALIZABLE,
        'i' | 'j' => match width {
            0..=2 => TYPE_SHORT,
            4 => TYPE_LONG,
            _ => return Err(MsiError::InvalidDatatype),
        },
        'v' => TYPE_BINARY,
        _ => return Err(MsiError::InvalidDatatype),
    };
    Ok(ty | nullable)
}

/// Column metadata as served by `_Columns` (or the built-in system tables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub table: String,
    /// 1-based position within the table.
    pub number: usize,
    pub name: String,
    pub ty: u32,
    pub temporary: bool,
}

impl ColumnInfo {
    #[must_use]
    pub fn new(table: &str, number: usize, name: &str, ty: u32) -> Self {
        Self {
            table: table.to_string(),
            number,
            name: name.to_string(),
            ty,
            temporary: ty & MSITYPE_TEMPORARY != 0,
        }
    }

    #[must_use]
    pub const fn is_key(&self) -> bool {
        is_key(self.ty)
    }

    #[must_use]
    pub const fn is_string(&self) -> bool {
        is_string(self.ty)
    }

    #[must_use]
    pub const fn is_binary(&self) -> bool {
        is_binary(self.ty)
    }

    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        is_nullable(self.ty)
    }

    #[must_use]
    pub const fn int_width(&self) -> usize {
        int_width(self.ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bias_encoding_boundaries() {
        assert_eq!(bias_encode(-1, 2).unwrap(), 0x7FFF);
        assert_eq!(bias_decode(0x7FFF, 2), Some(-1));
        assert_eq!(bias_encode(0, 2).unwrap(), 0x8000);
        assert_eq!(bias_decode(0x8000, 2), Some(0));
        assert_eq!(bias_decode(0, 2), None);
        assert_eq!(bias_decode(0, 4), None);
        assert_eq!(bias_encode(-1, 4).unwrap(), 0x7FFF_FFFF);
        assert_eq!(bias_decode(0x7FFF_FFFF, 4), Some(-1));
        assert_eq!(bias_decode(bias_encode(123_456, 4).unwrap(), 4), Some(123_456));
        assert!(bias_encode(40_000, 2).is_err());
        assert!(bias_encode(-32_769, 2).is_err());
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(type_code(type_string(72), false), "s72");
        assert_eq!(type_code(type_string(72) | MSITYPE_NULLABLE, false), "S72");
        assert_eq!(type_code(type_string(0) | MSITYPE_LOCALIZABLE, false), "l0");
        assert_eq!(type_code(TYPE_SHORT, false), "i2");
        assert_eq!(type_code(TYPE_LONG | MSITYPE_NULLABLE, false), "I4");
        assert_eq!(type_code(TYPE_BINARY, false), "v0");

        for code in ["s72", "S255", "L64", "i2", "I4", "V0", "s0"] {
            assert_eq!(type_code(parse_type_code(code).unwrap(), false), code);
        }
        assert!(parse_type_code("x5").is_err());
        assert!(parse_type_code("i3").is_err());
    }

    #[test]
    fn test_column_widths() {
        assert!(is_binary(TYPE_BINARY | MSITYPE_NULLABLE));
        assert!(!is_binary(type_string(0)));
        assert_eq!(bytes_per_column(TYPE_BINARY, 3), 2);
        assert_eq!(bytes_per_column(type_string(72), 3), 3);
        assert_eq!(bytes_per_column(TYPE_SHORT, 3), 2);
        assert_eq!(bytes_per_column(TYPE_LONG, 3), 4);
    }
}
