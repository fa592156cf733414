use nestdb::{Error, Options, DB};
use tempfile::TempDir;

fn open_db() -> (TempDir, DB) {
    let dir = tempfile::tempdir().unwrap();
    let db = DB::open(dir.path().join("test.db"), Options::default()).unwrap();
    (dir, db)
}

fn with_keys(db: &DB, keys: &[&[u8]]) {
    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket_if_not_exists(b"widgets")?;
        for key in keys {
            bucket.put(key, b"v")?;
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_bucket_cursor_returns_none_everywhere() {
    let (_dir, db) = open_db();
    with_keys(&db, &[]);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        assert!(cursor.first()?.is_none());
        assert!(cursor.last()?.is_none());
        assert!(cursor.next()?.is_none());
        assert!(cursor.prev()?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn first_and_last_find_the_extremes() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"foo", b"bar", b"baz"]);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let (first, _) = cursor.first()?.unwrap();
        assert_eq!(first.as_ref(), b"bar");

        let (last, _) = cursor.last()?.unwrap();
        assert_eq!(last.as_ref(), b"foo");
        Ok(())
    })
    .unwrap();
}

#[test]
fn forward_iteration_visits_every_key_in_order() {
    let (_dir, db) = open_db();
    let keys: Vec<Vec<u8>> = (0..1_000u32).map(|i| format!("{i:08}").into_bytes()).collect();
    let mut shuffled: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    shuffled.reverse();
    with_keys(&db, &shuffled);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let mut seen = Vec::new();
        let mut entry = cursor.first()?;
        while let Some((key, _)) = entry {
            seen.push(key.to_vec());
            entry = cursor.next()?;
        }

        assert_eq!(seen, keys);
        Ok(())
    })
    .unwrap();
}

#[test]
fn backward_iteration_mirrors_forward() {
    let (_dir, db) = open_db();
    let keys: Vec<Vec<u8>> = (0..1_000u32).map(|i| format!("{i:08}").into_bytes()).collect();
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    with_keys(&db, &refs);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let mut seen = Vec::new();
        let mut entry = cursor.last()?;
        while let Some((key, _)) = entry {
            seen.push(key.to_vec());
            entry = cursor.prev()?;
        }

        seen.reverse();
        assert_eq!(seen, keys);
        Ok(())
    })
    .unwrap();
}

#[test]
fn seek_lands_on_exact_or_next_key() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar", b"baz", b"foo"]);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let (key, _) = cursor.seek(b"baz")?.unwrap();
        assert_eq!(key.as_ref(), b"baz");

        let (key, _) = cursor.seek(b"c")?.unwrap();
        assert_eq!(key.as_ref(), b"foo");

        assert!(cursor.seek(b"zzz")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn seek_empty_key_returns_first_entry() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar", b"foo"]);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let (key, _) = cursor.seek(b"")?.unwrap();
        assert_eq!(key.as_ref(), b"bar");
        Ok(())
    })
    .unwrap();
}

#[test]
fn seek_works_across_branch_pages() {
    let (_dir, db) = open_db();
    let keys: Vec<Vec<u8>> = (0..5_000u32).map(|i| format!("{i:08}").into_bytes()).collect();
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    with_keys(&db, &refs);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        for probe in [0u32, 1, 999, 2_500, 4_998] {
            let target = format!("{probe:08}");
            let (key, _) = cursor.seek(target.as_bytes())?.unwrap();
            assert_eq!(key.as_ref(), target.as_bytes());
        }

        // Between two existing keys: land on the successor.
        let (key, _) = cursor.seek(b"00000999x")?.unwrap();
        assert_eq!(key.as_ref(), b"00001000");
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_buckets_surface_with_none_values() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.put(b"alpha", b"1")?;
        widgets.create_bucket(b"beta")?;
        widgets.put(b"gamma", b"2")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = widgets.cursor();

        let mut entries = Vec::new();
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            entries.push((key.to_vec(), value.map(|v| v.to_vec())));
            entry = cursor.next()?;
        }

        assert_eq!(
            entries,
            vec![
                (b"alpha".to_vec(), Some(b"1".to_vec())),
                (b"beta".to_vec(), None),
                (b"gamma".to_vec(), Some(b"2".to_vec())),
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_removes_current_entry() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar", b"baz", b"foo"]);

    db.execute_in_write_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        cursor.seek(b"baz")?.unwrap();
        cursor.delete()?;

        // The successor slides into the deleted slot.
        let (key, _) = cursor.next()?.unwrap();
        assert_eq!(key.as_ref(), b"foo");

        assert!(bucket.get(b"baz")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_twice_fails_with_not_positioned() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar", b"baz"]);

    db.execute_in_write_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        cursor.first()?.unwrap();
        cursor.delete()?;

        let err = cursor.delete().unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(Error::CursorNotPositioned)
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_without_position_fails() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar"]);

    db.execute_in_write_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let err = cursor.delete().unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(Error::CursorNotPositioned)
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_on_bucket_entry_fails() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.create_bucket(b"inner")?;

        let mut cursor = widgets.cursor();
        cursor.first()?.unwrap();
        let err = cursor.delete().unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(Error::IncompatibleValue)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn cursor_delete_in_read_tx_fails() {
    let (_dir, db) = open_db();
    with_keys(&db, &[b"bar"]);

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();
        cursor.first()?.unwrap();

        let err = cursor.delete().unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(Error::TransactionNotWritable)
        ));
        Ok(())
    })
    .unwrap();
}

#[test]
fn iteration_sees_uncommitted_writes_in_same_tx() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"b", b"2")?;
        bucket.put(b"a", b"1")?;
        bucket.put(b"c", b"3")?;

        let mut cursor = bucket.cursor();
        let mut keys = Vec::new();
        let mut entry = cursor.first()?;
        while let Some((key, _)) = entry {
            keys.push(key.to_vec());
            entry = cursor.next()?;
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_all_keys_through_cursor_empties_bucket() {
    let (_dir, db) = open_db();
    let keys: Vec<Vec<u8>> = (0..500u32).map(|i| format!("{i:06}").into_bytes()).collect();
    let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
    with_keys(&db, &refs);

    db.execute_in_write_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut cursor = bucket.cursor();

        let mut entry = cursor.first()?;
        while entry.is_some() {
            cursor.delete()?;
            entry = cursor.next()?;
        }
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        assert!(bucket.cursor().first()?.is_none());
        tx.check()
    })
    .unwrap();
}
