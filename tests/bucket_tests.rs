use nestdb::{Error, Options, DB};
use tempfile::TempDir;

fn open_db() -> (TempDir, DB) {
    let dir = tempfile::tempdir().unwrap();
    let db = DB::open(dir.path().join("test.db"), Options::default()).unwrap();
    (dir, db)
}

fn kind(err: &eyre::Report) -> Option<&Error> {
    err.downcast_ref::<Error>()
}

#[test]
fn put_then_get_returns_value() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn repeated_put_overwrites_single_key() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        bucket.put(b"foo", b"baz")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"baz"[..]));

        let mut keys = 0;
        bucket.for_each(|_, _| {
            keys += 1;
            Ok(())
        })?;
        assert_eq!(keys, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn for_each_visits_keys_in_byte_order() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"0000")?;
        bucket.put(b"baz", b"0001")?;
        bucket.put(b"bar", b"0002")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let mut seen = Vec::new();
        bucket.for_each(|key, value| {
            seen.push((key.to_vec(), value.unwrap().to_vec()));
            Ok(())
        })?;

        assert_eq!(
            seen,
            vec![
                (b"bar".to_vec(), b"0002".to_vec()),
                (b"baz".to_vec(), b"0001".to_vec()),
                (b"foo".to_vec(), b"0000".to_vec()),
            ]
        );
        Ok(())
    })
    .unwrap();
}

#[test]
fn get_missing_key_returns_none() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        assert!(bucket.get(b"fo")?.is_none());
        assert!(bucket.get(b"foz")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn empty_key_is_rejected() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        let err = bucket.put(b"", b"value").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::KeyRequired)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn oversized_key_is_rejected() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        let key = vec![0x41u8; nestdb::MAX_KEY_SIZE + 1];
        let err = bucket.put(&key, b"value").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::KeyTooLarge)));

        let key = vec![0x41u8; nestdb::MAX_KEY_SIZE];
        bucket.put(&key, b"value")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn put_on_read_tx_is_rejected() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        tx.create_bucket(b"widgets").map(|_| ())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"widgets")?.unwrap();
        let err = bucket.put(b"foo", b"bar").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::TransactionNotWritable)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_missing_key_is_a_noop() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        bucket.delete(b"missing")?;
        assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_twice_fails_with_exists() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        tx.create_bucket(b"widgets")?;
        let err = tx.create_bucket(b"widgets").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::BucketExists)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_over_plain_key_fails_with_incompatible_value() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.put(b"foo", b"bar")?;

        let err = widgets.create_bucket(b"foo").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::IncompatibleValue)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn put_over_bucket_key_fails_with_incompatible_value() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.create_bucket(b"inner")?;

        let err = widgets.put(b"inner", b"value").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::IncompatibleValue)));

        let err = widgets.delete(b"inner").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::IncompatibleValue)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_with_empty_name_fails() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let err = tx.create_bucket(b"").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::BucketNameRequired)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn create_bucket_if_not_exists_reopens_existing() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket_if_not_exists(b"widgets")?;
        bucket.put(b"foo", b"bar")?;
        let again = tx.create_bucket_if_not_exists(b"widgets")?;
        assert_eq!(again.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
        Ok(())
    })
    .unwrap();
}

#[test]
fn get_on_bucket_name_returns_none() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.create_bucket(b"inner")?;
        assert!(widgets.get(b"inner")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_removes_tree_recursively() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        let inner = widgets.create_bucket(b"inner")?;
        let deep = inner.create_bucket(b"deep")?;
        deep.put(b"k", b"v")?;
        inner.put(b"plain", b"value")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        widgets.delete_bucket(b"inner")?;
        assert!(widgets.bucket(b"inner")?.is_none());
        Ok(())
    })
    .unwrap();

    db.execute_in_write_tx(|tx| {
        tx.check()?;
        let widgets = tx.bucket(b"widgets")?.unwrap();
        assert!(widgets.bucket(b"inner")?.is_none());
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_missing_bucket_fails_with_not_found() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let err = tx.delete_bucket(b"nope").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::BucketNotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn delete_bucket_on_plain_key_fails_with_incompatible_value() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.put(b"foo", b"bar")?;
        let err = widgets.delete_bucket(b"foo").unwrap_err();
        assert!(matches!(kind(&err), Some(Error::IncompatibleValue)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn nested_bucket_values_survive_across_transactions() {
    let (_dir, db) = open_db();

    // Mirrors a history where a sub-bucket and growing sibling data share
    // the same parent across several commits.
    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        widgets.create_bucket(b"foo")?;
        widgets.put(b"bar", b"000")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        widgets.put(b"bar", b"xxxx")?;
        for i in 0..10_000u32 {
            widgets.put(format!("{i}").as_bytes(), format!("{:032}", i).as_bytes())?;
        }
        Ok(())
    })
    .unwrap();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let foo = widgets.bucket(b"foo")?.unwrap();
        foo.put(b"baz", b"yyyy")?;
        tx.check()
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let foo = widgets.bucket(b"foo")?.unwrap();
        assert_eq!(foo.get(b"baz")?.as_deref(), Some(&b"yyyy"[..]));
        assert_eq!(widgets.get(b"bar")?.as_deref(), Some(&b"xxxx"[..]));
        for i in (0..10_000u32).step_by(997) {
            assert_eq!(
                widgets.get(format!("{i}").as_bytes())?.as_deref(),
                Some(format!("{:032}", i).as_bytes())
            );
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn small_bucket_stays_inline_after_commit() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        let tiny = widgets.create_bucket(b"tiny")?;
        tiny.put(b"a", b"1")?;
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let tiny = widgets.bucket(b"tiny")?.unwrap();
        assert_eq!(tiny.root(), 0, "small bucket should be stored inline");
        assert_eq!(tiny.get(b"a")?.as_deref(), Some(&b"1"[..]));

        let stats = widgets.stats()?;
        assert_eq!(stats.inline_bucket_n, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn growing_bucket_moves_out_of_inline_storage() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        let child = widgets.create_bucket(b"child")?;
        // Well past PAGE_SIZE / 4 of payload.
        for i in 0..64u32 {
            child.put(format!("key{i:04}").as_bytes(), &[0x55u8; 64])?;
        }
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let child = widgets.bucket(b"child")?.unwrap();
        assert_ne!(child.root(), 0, "large bucket must own real pages");
        assert_eq!(child.get(b"key0063")?.as_deref(), Some(&[0x55u8; 64][..]));

        let stats = widgets.stats()?;
        assert_eq!(stats.inline_bucket_n, 0);
        assert_eq!(stats.bucket_n, 2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn stats_count_keys_depth_and_pages() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let widgets = tx.create_bucket(b"widgets")?;
        for i in 0..500u32 {
            widgets.put(format!("{i:08}").as_bytes(), &[0u8; 64])?;
        }
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let widgets = tx.bucket(b"widgets")?.unwrap();
        let stats = widgets.stats()?;

        assert_eq!(stats.key_n, 500);
        assert_eq!(stats.bucket_n, 1);
        assert!(stats.leaf_page_n > 1, "500 * ~80B spans several leaves");
        assert!(stats.branch_page_n >= 1);
        assert!(stats.depth >= 2);
        assert!(stats.leaf_in_use > 500 * (8 + 64));
        assert!(stats.leaf_alloc >= stats.leaf_page_n * nestdb::PAGE_SIZE as u64);
        Ok(())
    })
    .unwrap();
}

#[test]
fn high_fill_percent_packs_append_only_load_tighter() {
    let (_dir, db) = open_db();

    db.execute_in_write_tx(|tx| {
        let bucket = tx.create_bucket(b"packed")?;
        bucket.set_fill_percent(1.0);
        for i in 0..2_000u32 {
            bucket.put(format!("{i:08}").as_bytes(), &[7u8; 32])?;
        }
        Ok(())
    })
    .unwrap();

    db.execute_in_read_tx(|tx| {
        let bucket = tx.bucket(b"packed")?.unwrap();
        for i in (0..2_000u32).step_by(211) {
            assert!(bucket.get(format!("{i:08}").as_bytes())?.is_some());
        }
        tx.check()
    })
    .unwrap();
}
