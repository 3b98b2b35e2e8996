//! IDT text import and export.
//!
//! An IDT file is tab separated with CRLF line ends: column names, column
//! type codes, then the table name followed by its key columns, then one
//! line per row. Binary cells name a file in a directory called after
//! the table, next to the IDT file.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{debug, info, warn};

use super::Database;
use crate::core::column::{ColumnInfo, MSITYPE_KEY, bias_decode, parse_type_code, type_code};
use crate::core::{MsiError, Record, Result, SummaryInfo, Table};
use crate::executor::{TableView, View, column_bit};

/// Pseudo-table carrying the database codepage.
pub const FORCE_CODEPAGE: &str = "_ForceCodepage";
/// Pseudo-table carrying the summary information properties.
pub const SUMMARY_INFORMATION: &str = "_SummaryInformation";

/// Embedded CRLF is written as 0x11 0x19 and a bare LF as NUL.
fn escape_field(text: &str) -> String {
    text.replace("\r\n", "\u{11}\u{19}").replace('\n', "\0")
}

fn unescape_field(text: &str) -> String {
    text.replace('\0', "\n").replace("\u{11}\u{19}", "\r\n")
}

fn split_fields(line: &str) -> Vec<String> {
    if line.is_empty() {
        return Vec::new();
    }
    line.split('\t').map(unescape_field).collect()
}

fn parse_lines(text: &str) -> Vec<Vec<String>> {
    let mut lines: Vec<&str> = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l)).collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.into_iter().map(split_fields).collect()
}

fn write_line(writer: &mut dyn Write, fields: &[String]) -> Result<()> {
    writer.write_all(fields.join("\t").as_bytes())?;
    writer.write_all(b"\r\n")?;
    Ok(())
}

impl Database {
    fn cell_text(&self, col: &ColumnInfo, raw: u32) -> String {
        if raw == 0 {
            String::new()
        } else if col.is_string() {
            self.strings().lookup(raw).unwrap_or("").to_string()
        } else {
            bias_decode(raw, col.int_width()).map(|v| v.to_string()).unwrap_or_default()
        }
    }

    /// Writes `table` in IDT form. Binary cells are stored as files under
    /// `folder/<table>/`; without a folder, a table with binary data fails.
    pub fn export(&mut self, table: &str, writer: &mut dyn Write, folder: Option<&Path>) -> Result<()> {
        match table {
            FORCE_CODEPAGE => {
                writer.write_all(format!("\r\n\r\n{}\t{FORCE_CODEPAGE}\r\n", self.codepage()).as_bytes())?;
                return Ok(());
            }
            SUMMARY_INFORMATION => return self.export_summary(writer),
            _ => {}
        }

        let table: Table = self.load_table(table)?.clone();
        write_line(writer, &table.columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>())?;
        write_line(
            writer,
            &table.columns.iter().map(|c| type_code(c.ty, c.temporary)).collect::<Vec<_>>(),
        )?;
        let mut labels = vec![table.name.clone()];
        labels.extend(table.columns.iter().filter(|c| c.is_key()).map(|c| c.name.clone()));
        write_line(writer, &labels)?;

        for (r, row) in table.rows().enumerate() {
            let mut fields = Vec::with_capacity(row.len());
            for (col, &raw) in table.columns.iter().zip(row) {
                if !col.is_binary() {
                    fields.push(escape_field(&self.cell_text(col, raw)));
                    continue;
                }
                if raw == 0 {
                    fields.push(String::new());
                    continue;
                }
                let folder = folder.ok_or_else(|| MsiError::failed(format!("{} has binary data", table.name)))?;
                let file = format!("{}.ibd", self.cell_text(&table.columns[0], row[0]));
                let dir = folder.join(&table.name);
                fs::create_dir_all(&dir)?;
                let stream_name = self.row_stream_name(&table, r)?;
                let data = self.stream(&stream_name).map(|s| s.into_bytes()).unwrap_or_default();
                fs::write(dir.join(&file), &data)?;
                fields.push(file);
            }
            write_line(writer, &fields)?;
        }
        debug!(table = %table.name, rows = table.row_count(), "exported table");
        Ok(())
    }

    /// Exports `table` to `folder/file`.
    pub fn export_to_file(&mut self, table: &str, folder: &Path, file: &str) -> Result<()> {
        let mut out = fs::File::create(folder.join(file))?;
        self.export(table, &mut out, Some(folder))?;
        out.flush()?;
        Ok(())
    }

    fn export_summary(&self, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(format!("PropertyId\tValue\r\ni2\tl255\r\n{SUMMARY_INFORMATION}\tPropertyId\r\n").as_bytes())?;
        let info = self.summary_info()?;
        for (pid, value) in info.properties() {
            write_line(writer, &[pid.to_string(), escape_field(&value.to_string())])?;
        }
        Ok(())
    }

    /// Imports one IDT file. Binary cells are read relative to the file's directory.
    pub fn import(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), "IDT file is not valid UTF-8");
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        let folder = path.parent().unwrap_or_else(|| Path::new("."));
        self.import_text(&text, folder)
    }

    /// Imports IDT text; `folder` is where binary cell files are looked up.
    pub fn import_text(&mut self, text: &str, folder: &Path) -> Result<()> {
        self.check_writable()?;
        let lines = parse_lines(text);
        if lines.len() < 3 {
            return Err(MsiError::failed("IDT data needs three header lines"));
        }
        let (names, types, labels) = (&lines[0], &lines[1], &lines[2]);

        if names.is_empty() && types.is_empty() && labels.len() == 2 && labels[1] == FORCE_CODEPAGE {
            let codepage = labels[0]
                .trim()
                .parse()
                .map_err(|_| MsiError::InvalidData(format!("bad codepage {}", labels[0])))?;
            info!(codepage, "codepage forced by import");
            return self.set_codepage(codepage);
        }
        if labels.first().map(String::as_str) == Some(SUMMARY_INFORMATION) {
            return self.import_summary(&lines[3..]);
        }
        if names.is_empty() || names.len() != types.len() || labels.is_empty() {
            return Err(MsiError::failed("malformed IDT header"));
        }

        let table = labels[0].clone();
        if !self.table_exists(&table) {
            let mut columns = Vec::with_capacity(names.len());
            for (i, (name, code)) in names.iter().zip(types).enumerate() {
                let mut ty = parse_type_code(code)?;
                if labels[1..].contains(name) {
                    ty |= MSITYPE_KEY;
                }
                columns.push(ColumnInfo::new(&table, i + 1, name, ty));
            }
            for key in &labels[1..] {
                if !names.contains(key) {
                    return Err(MsiError::InvalidData(format!("key {key} is not a column of {table}")));
                }
            }
            self.create_table(&table, &columns, true)?;
        }

        let mut view = TableView::new(self, &table)?;
        let (_, column_count) = view.get_dimensions(self)?;
        if column_count != names.len() {
            return Err(MsiError::DatatypeMismatch(format!(
                "{table} has {column_count} columns, IDT data has {}",
                names.len()
            )));
        }
        let columns = (1..=column_count)
            .map(|c| view.get_column_info(self, c))
            .collect::<Result<Vec<_>>>()?;
        for ((col, name), code) in columns.iter().zip(names).zip(types) {
            if col.name != *name || type_code(parse_type_code(code)?, false) != type_code(col.ty, false) {
                return Err(MsiError::DatatypeMismatch(format!(
                    "column {table}.{} does not match IDT column {name} ({code})",
                    col.name
                )));
            }
        }
        let update_mask = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_key())
            .fold(0u64, |m, (i, _)| m | column_bit(i));

        let mut rows = 0;
        for fields in lines.iter().skip(3).filter(|f| !f.is_empty()) {
            let mut rec = Record::new(column_count)?;
            for (i, col) in columns.iter().enumerate() {
                let text = fields.get(i).map_or("", String::as_str);
                if text.is_empty() {
                    continue;
                }
                if col.is_binary() {
                    rec.load_stream_from_file(i + 1, folder.join(&table).join(text))?;
                } else if col.is_string() {
                    rec.set_string(i + 1, text)?;
                } else {
                    let v = text
                        .trim()
                        .parse()
                        .map_err(|_| MsiError::InvalidData(format!("{text:?} is not an integer")))?;
                    rec.set_int(i + 1, v)?;
                }
            }
            match view.find_row_by_keys(self, &rec)? {
                Some(row) => view.set_row(self, row, &rec, update_mask)?,
                None => view.insert_row(self, &rec, false)?,
            }
            rows += 1;
        }
        info!(table = %table, rows, "imported table");
        Ok(())
    }

    fn import_summary(&mut self, rows: &[Vec<String>]) -> Result<()> {
        let mut info = SummaryInfo::new();
        for fields in rows.iter().filter(|f| !f.is_empty()) {
            let pid = fields[0]
                .trim()
                .parse()
                .map_err(|_| MsiError::InvalidData(format!("bad property id {}", fields[0])))?;
            let value = fields.get(1).map_or("", String::as_str);
            info.set_from_text(pid, value)?;
        }
        self.set_summary_info(&info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PropertyValue;
    use crate::core::summary_info::{PID_CODEPAGE, PID_TITLE};
    use tempfile::TempDir;

    const FEATURE_IDT: &str = "Feature\tTitle\tLevel\r\ns38\tS64\ti2\r\nFeature\tFeature\r\nMain\tMain Feature\t1\r\nOff\t\t0\r\n";

    fn export_string(db: &mut Database, table: &str, folder: Option<&Path>) -> String {
        let mut out = Vec::new();
        db.export(table, &mut out, folder).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_import_then_export_is_identical() {
        let mut db = Database::new();
        db.import_text(FEATURE_IDT, Path::new(".")).unwrap();
        assert_eq!(export_string(&mut db, "Feature", None), FEATURE_IDT);
    }

    #[test]
    fn test_import_replaces_matching_keys() {
        let mut db = Database::new();
        db.import_text(FEATURE_IDT, Path::new(".")).unwrap();
        db.import_text("Feature\tTitle\tLevel\r\ns38\tS64\ti2\r\nFeature\tFeature\r\nMain\tRenamed\t2\r\n", Path::new("."))
            .unwrap();
        let text = export_string(&mut db, "Feature", None);
        assert!(text.contains("Main\tRenamed\t2\r\n"));
        assert_eq!(db.table("Feature").unwrap().row_count(), 2);
    }

    #[test]
    fn test_import_rejects_mismatched_columns() {
        let mut db = Database::new();
        db.import_text(FEATURE_IDT, Path::new(".")).unwrap();
        let renamed = "Feature\tCaption\tLevel\r\ns38\tS64\ti2\r\nFeature\tFeature\r\nMain\tOther\t1\r\n";
        assert!(matches!(db.import_text(renamed, Path::new(".")), Err(MsiError::DatatypeMismatch(_))));
        let retyped = "Feature\tTitle\tLevel\r\ns38\tS64\ti4\r\nFeature\tFeature\r\nMain\tOther\t1\r\n";
        assert!(matches!(db.import_text(retyped, Path::new(".")), Err(MsiError::DatatypeMismatch(_))));
        assert_eq!(export_string(&mut db, "Feature", None), FEATURE_IDT);
    }

    #[test]
    fn test_escaped_line_breaks() {
        let mut db = Database::new();
        let idt = "Property\tValue\r\ns72\tl0\r\nProperty\tProperty\r\nText\tone\u{11}\u{19}two\0three\r\n";
        db.import_text(idt, Path::new(".")).unwrap();
        let mut q = db.open_query("SELECT `Value` FROM `Property`").unwrap();
        q.execute(None).unwrap();
        assert_eq!(q.fetch().unwrap().unwrap().get_string(1), "one\r\ntwo\nthree");
        drop(q);
        assert_eq!(export_string(&mut db, "Property", None), idt);
    }

    #[test]
    fn test_binary_cells_round_trip_through_files() {
        let dir = TempDir::new().unwrap();
        let mut db = Database::new();
        db.execute_sql("CREATE TABLE `Binary` (`Name` CHAR(72) NOT NULL, `Data` OBJECT PRIMARY KEY `Name`)")
            .unwrap();
        let mut q = db.open_query("INSERT INTO `Binary` (`Name`, `Data`) VALUES (?, ?)").unwrap();
        let mut params = Record::new(2).unwrap();
        params.set_string(1, "Icon").unwrap();
        params.set_stream(2, crate::core::Stream::new(b"ICO".to_vec())).unwrap();
        q.execute(Some(&params)).unwrap();
        drop(q);

        db.export_to_file("Binary", dir.path(), "Binary.idt").unwrap();
        assert_eq!(fs::read(dir.path().join("Binary").join("Icon.ibd")).unwrap(), b"ICO");

        let mut fresh = Database::new();
        fresh.import(&dir.path().join("Binary.idt")).unwrap();
        assert_eq!(fresh.stream("Binary.Icon").unwrap().len(), 3);
    }

    #[test]
    fn test_pseudo_tables() {
        let mut db = Database::new();
        db.import_text("\r\n\r\n1252\t_ForceCodepage\r\n", Path::new(".")).unwrap();
        assert_eq!(db.codepage(), 1252);
        assert_eq!(export_string(&mut db, FORCE_CODEPAGE, None), "\r\n\r\n1252\t_ForceCodepage\r\n");

        let summary = "PropertyId\tValue\r\ni2\tl255\r\n_SummaryInformation\tPropertyId\r\n1\t1252\r\n2\tInstallation Database\r\n";
        db.import_text(summary, Path::new(".")).unwrap();
        let info = db.summary_info().unwrap();
        assert_eq!(info.property(PID_CODEPAGE), Some(&PropertyValue::Int(1252)));
        assert_eq!(info.property(PID_TITLE), Some(&PropertyValue::Str("Installation Database".into())));
        assert_eq!(export_string(&mut db, SUMMARY_INFORMATION, None), summary);
    }

    #[test]
    fn test_rejects_short_files() {
        let mut db = Database::new();
        assert!(matches!(db.import_text("a\tb\r\n", Path::new(".")), Err(MsiError::FunctionFailed(_))));
    }
}
