// End-to-end checks through the public API: SQL, commit, IDT files, merge, transforms
use msiquery::database::{FORCE_CODEPAGE, SUMMARY_INFORMATION};
use msiquery::{Database, Field, MsiError, OpenMode, Record, Stream};
use tempfile::TempDir;

fn rows(db: &mut Database, sql: &str) -> Vec<String> {
    let mut query = db.open_query(sql).unwrap();
    let mut out = Vec::new();
    query
        .iterate(None, |rec| {
            out.push(rec.to_string());
            Ok(())
        })
        .unwrap();
    out
}

fn installer() -> Database {
    let mut db = Database::new();
    db.execute_sql("CREATE TABLE `Feature` (`Feature` CHAR(38) NOT NULL, `Title` CHAR(64), `Level` SHORT NOT NULL PRIMARY KEY `Feature`)")
        .unwrap();
    db.execute_sql("CREATE TABLE `Component` (`Component` CHAR(72) NOT NULL, `Directory_` CHAR(72) NOT NULL, `Attributes` SHORT NOT NULL PRIMARY KEY `Component`)")
        .unwrap();
    db.execute_sql("CREATE TABLE `FeatureComponents` (`Feature_` CHAR(38) NOT NULL, `Component_` CHAR(72) NOT NULL PRIMARY KEY `Feature_`, `Component_`)")
        .unwrap();

    let features = [("Core", "Core files", 1), ("Docs", "Documentation", 3), ("Tools", "Tools", 0)];
    for (f, t, l) in features {
        let mut q = db
            .open_query("INSERT INTO `Feature` (`Feature`, `Title`, `Level`) VALUES (?, ?, ?)")
            .unwrap();
        q.execute(Some(&Record::from_fields(vec![Field::Str(f.into()), Field::Str(t.into()), Field::Int(l)]).unwrap()))
            .unwrap();
    }
    for (c, d) in [("MainExe", "INSTALLDIR"), ("Manual", "DocDir"), ("Helper", "INSTALLDIR")] {
        db.execute_sql(&format!(
            "INSERT INTO `Component` (`Component`, `Directory_`, `Attributes`) VALUES ('{c}', '{d}', 0)"
        ))
        .unwrap();
    }
    for (f, c) in [("Core", "MainExe"), ("Docs", "Manual"), ("Core", "Helper"), ("Tools", "Helper")] {
        db.execute_sql(&format!(
            "INSERT INTO `FeatureComponents` (`Feature_`, `Component_`) VALUES ('{f}', '{c}')"
        ))
        .unwrap();
    }
    db
}

#[test]
fn test_three_way_join() {
    let mut db = installer();
    let joined = rows(
        &mut db,
        "SELECT `Feature`.`Feature`, `Component`.`Component`, `Directory_` FROM `Feature`, `FeatureComponents`, `Component` \
         WHERE `Feature`.`Feature` = `FeatureComponents`.`Feature_` AND `FeatureComponents`.`Component_` = `Component`.`Component` \
         ORDER BY `Feature`.`Feature`, `Component`.`Component`",
    );
    assert_eq!(
        joined,
        vec![
            "Core\tHelper\tINSTALLDIR",
            "Core\tMainExe\tINSTALLDIR",
            "Docs\tManual\tDocDir",
            "Tools\tHelper\tINSTALLDIR",
        ]
    );

    let filtered = rows(
        &mut db,
        "SELECT `Component`.`Component` FROM `Feature`, `FeatureComponents`, `Component` \
         WHERE `Feature`.`Level` = 3 AND `Feature`.`Feature` = `FeatureComponents`.`Feature_` \
         AND `FeatureComponents`.`Component_` = `Component`.`Component`",
    );
    assert_eq!(filtered, vec!["Manual"]);
}

#[test]
fn test_join_with_empty_table_is_empty() {
    let mut db = installer();
    db.execute_sql("CREATE TABLE `Condition` (`Feature_` CHAR(38) NOT NULL, `Level` SHORT NOT NULL PRIMARY KEY `Feature_`, `Level`)")
        .unwrap();
    let joined = rows(
        &mut db,
        "SELECT * FROM `Feature`, `Condition`, `Component` WHERE `Feature`.`Feature` = `Condition`.`Feature_`",
    );
    assert!(joined.is_empty());
    assert_eq!(rows(&mut db, "SELECT * FROM `Feature`, `Condition`").len(), 0);
}

#[test]
fn test_zero_level_matches_but_reads_null() {
    let mut db = installer();
    assert_eq!(rows(&mut db, "SELECT `Feature`, `Level` FROM `Feature` WHERE `Level` = 0"), vec!["Tools\t"]);
}

#[test]
fn test_bias_boundaries() {
    let mut db = Database::new();
    db.execute_sql("CREATE TABLE `Num` (`Id` SHORT NOT NULL, `Big` LONG PRIMARY KEY `Id`)").unwrap();
    db.execute_sql("INSERT INTO `Num` (`Id`, `Big`) VALUES (32767, 2147483647)").unwrap();
    db.execute_sql("INSERT INTO `Num` (`Id`, `Big`) VALUES (-1, -1)").unwrap();
    assert!(db.execute_sql("INSERT INTO `Num` (`Id`, `Big`) VALUES (32768, 1)").is_err());

    let table = db.table("Num").unwrap();
    let cells: Vec<Vec<u32>> = table.rows().map(<[u32]>::to_vec).collect();
    assert!(cells.contains(&vec![0xFFFF, 0xFFFF_FFFF]));
    assert!(cells.contains(&vec![0x7FFF, 0x7FFF_FFFF]));
    assert_eq!(rows(&mut db, "SELECT `Id`, `Big` FROM `Num` ORDER BY `Id`"), vec!["-1\t-1", "32767\t2147483647"]);
}

#[test]
fn test_commit_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("product.msi");
    {
        let mut db = Database::open(&path, OpenMode::Create).unwrap();
        db.execute_sql("CREATE TABLE `Property` (`Property` CHAR(72) NOT NULL, `Value` CHAR(0) PRIMARY KEY `Property`)")
            .unwrap();
        db.execute_sql("INSERT INTO `Property` (`Property`, `Value`) VALUES ('ProductName', 'Demo')").unwrap();
        db.execute_sql("INSERT INTO `Property` (`Property`, `Value`) VALUES ('Scratch', 'gone') TEMPORARY")
            .unwrap();
        db.commit().unwrap();
    }

    let mut db = Database::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(rows(&mut db, "SELECT * FROM `Property`"), vec!["ProductName\tDemo"]);
    assert!(matches!(
        db.execute_sql("DELETE FROM `Property`"),
        Err(MsiError::AccessDenied)
    ));
}

#[test]
fn test_streams_table() {
    let mut db = Database::new();
    let mut q = db.open_query("INSERT INTO `_Streams` (`Name`, `Data`) VALUES (?, ?)").unwrap();
    let mut params = Record::new(2).unwrap();
    params.set_string(1, "Cabinet").unwrap();
    params.set_stream(2, Stream::new(b"MSCF".to_vec())).unwrap();
    q.execute(Some(&params)).unwrap();
    q.close().unwrap();
    drop(q);

    assert_eq!(db.stream("Cabinet").unwrap().len(), 4);
    assert_eq!(rows(&mut db, "SELECT `Name` FROM `_Streams`"), vec!["Cabinet"]);
}

#[test]
fn test_export_drop_import_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut db = installer();
    db.execute_sql("UPDATE `Feature` SET `Title` = 'Line one\r\nLine two' WHERE `Feature` = 'Docs'").unwrap();
    let before = rows(&mut db, "SELECT * FROM `Feature` ORDER BY `Feature`");

    db.export_to_file("Feature", dir.path(), "Feature.idt").unwrap();
    db.execute_sql("DROP TABLE `Feature`").unwrap();
    assert!(!db.table_exists("Feature"));

    db.import(&dir.path().join("Feature.idt")).unwrap();
    assert_eq!(rows(&mut db, "SELECT * FROM `Feature` ORDER BY `Feature`"), before);
    // a stored zero survives the trip even though it reads back as NULL
    assert_eq!(rows(&mut db, "SELECT `Feature` FROM `Feature` WHERE `Level` = 0"), vec!["Tools"]);
}

#[test]
fn test_pseudo_tables_export() {
    let dir = TempDir::new().unwrap();
    let mut db = installer();
    db.set_codepage(1252).unwrap();
    db.export_to_file(FORCE_CODEPAGE, dir.path(), "codepage.idt").unwrap();
    db.export_to_file(SUMMARY_INFORMATION, dir.path(), "summary.idt").unwrap();

    let mut other = Database::new();
    other.import(&dir.path().join("codepage.idt")).unwrap();
    assert_eq!(other.codepage(), 1252);
    other.import(&dir.path().join("summary.idt")).unwrap();
}

#[test]
fn test_merge_conflicts_block_everything() {
    let mut target = installer();
    let mut source = installer();
    source.execute_sql("UPDATE `Feature` SET `Title` = 'Changed' WHERE `Feature` = 'Core'").unwrap();
    source.execute_sql("INSERT INTO `Feature` (`Feature`, `Title`, `Level`) VALUES ('New', 'New', 1)").unwrap();

    let outcome = target.merge(&mut source, Some("_MergeErrors")).unwrap();
    assert!(outcome.has_conflicts());
    assert_eq!(outcome.conflicts[0].table, "Feature");
    assert!(rows(&mut target, "SELECT `Feature` FROM `Feature` WHERE `Feature` = 'New'").is_empty());
    assert_eq!(rows(&mut target, "SELECT * FROM `_MergeErrors`"), vec!["Feature\t1"]);
}

#[test]
fn test_merge_without_conflicts() {
    let mut target = installer();
    let mut source = installer();
    source.execute_sql("INSERT INTO `Feature` (`Feature`, `Title`, `Level`) VALUES ('New', 'New', 1)").unwrap();

    let outcome = target.merge(&mut source, None).unwrap();
    assert!(!outcome.has_conflicts());
    assert_eq!(outcome.rows_inserted, 1);
    assert_eq!(rows(&mut target, "SELECT `Title` FROM `Feature` WHERE `Feature` = 'New'"), vec!["New"]);
}

#[test]
fn test_transform_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("upgrade.mst");

    let mut reference = installer();
    let mut updated = installer();
    updated.execute_sql("UPDATE `Feature` SET `Level` = 2 WHERE `Feature` = 'Docs'").unwrap();
    updated.execute_sql("DELETE FROM `FeatureComponents` WHERE `Feature_` = 'Tools'").unwrap();
    updated.execute_sql("DELETE FROM `Feature` WHERE `Feature` = 'Tools'").unwrap();
    updated.generate_transform(&mut reference, &path).unwrap();

    let target_path = dir.path().join("target.msi");
    let mut target = installer();
    target.set_output_path(&target_path);
    target.apply_transform(&path).unwrap();
    target.commit().unwrap();

    let mut reopened = Database::open(&target_path, OpenMode::ReadOnly).unwrap();
    assert_eq!(
        rows(&mut reopened, "SELECT `Feature`, `Level` FROM `Feature` ORDER BY `Feature`"),
        vec!["Core\t1", "Docs\t2"]
    );
    assert_eq!(rows(&mut reopened, "SELECT * FROM `FeatureComponents`").len(), 3);
}

#[test]
fn test_widest_table_updates() {
    let mut db = Database::new();
    let defs = |n: usize| (1..=n).map(|i| format!("`C{i}` SHORT")).collect::<Vec<_>>().join(", ");
    assert!(db.execute_sql(&format!("CREATE TABLE `Over` ({} PRIMARY KEY `C1`)", defs(33))).is_err());
    assert!(!db.table_exists("Over"));

    db.execute_sql(&format!("CREATE TABLE `Wide` ({} PRIMARY KEY `C1`)", defs(32))).unwrap();
    db.execute_sql("INSERT INTO `Wide` (`C1`, `C32`) VALUES (1, 5)").unwrap();
    db.execute_sql("UPDATE `Wide` SET `C2` = 3, `C32` = 6 WHERE `C1` = 1").unwrap();
    assert_eq!(rows(&mut db, "SELECT `C2`, `C32` FROM `Wide`"), vec!["3\t6"]);
}

#[test]
fn test_rejected_update_changes_nothing() {
    let mut db = Database::new();
    db.execute_sql("CREATE TABLE `T` (`K` SHORT NOT NULL, `A` CHAR(16), `B` SHORT NOT NULL PRIMARY KEY `K`)").unwrap();
    db.execute_sql("INSERT INTO `T` (`K`, `A`, `B`) VALUES (1, 'old', 5)").unwrap();
    assert!(matches!(
        db.execute_sql("UPDATE `T` SET `A` = 'new', `B` = NULL"),
        Err(MsiError::InvalidData(_))
    ));
    assert_eq!(rows(&mut db, "SELECT * FROM `T`"), vec!["1\told\t5"]);
}

#[test]
fn test_deleted_strings_leave_the_pool() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pool.msi");
    let mut db = Database::open(&path, OpenMode::Create).unwrap();
    db.execute_sql("CREATE TABLE `T` (`K` CHAR(16) NOT NULL PRIMARY KEY `K`)").unwrap();
    db.execute_sql("INSERT INTO `T` (`K`) VALUES ('ghost')").unwrap();
    db.execute_sql("DELETE FROM `T`").unwrap();
    db.commit().unwrap();

    let reopened = Database::open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(reopened.strings().id_of("ghost"), None);
    assert!(reopened.strings().id_of("K").is_some());
}
