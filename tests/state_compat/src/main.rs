fn main() {
    println!("Run `cargo test -p state-compat` to execute session record compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use volsync_transfer::{Session, SessionState, SessionStore, TransferKind};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Deserializes a fixture into a Rust type, re-serializes it, and compares
    /// the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to serialize {name}: {e}"));
        assert_eq!(
            fixture, reserialized,
            "roundtrip mismatch for {name}:\nfixture:      {fixture}\nreserialized: {reserialized}"
        );
        parsed
    }

    #[test]
    fn upload_session_roundtrip() {
        let session: Session = roundtrip_test("session_upload.json");
        assert_eq!(session.key.kind, TransferKind::Upload);
        assert_eq!(session.state, SessionState::InProgress);
        assert_eq!(session.plan.part_count(), 3);
        assert_eq!(session.missing_parts(), vec![1]);
        assert_eq!(session.completed_bytes(), 1024 + 452);
        assert!(session.whole_object_digest.is_none());
    }

    #[test]
    fn download_session_roundtrip() {
        let session: Session = roundtrip_test("session_download.json");
        assert_eq!(session.key.kind, TransferKind::Download);
        assert_eq!(session.missing_parts(), vec![0, 2]);
        assert_eq!(session.completed_parts[&1].token, "1024");
        assert_eq!(
            session.whole_object_digest.as_deref(),
            Some(session.source_digest.as_str())
        );
    }

    #[test]
    fn completed_session_roundtrip() {
        let session: Session = roundtrip_test("session_completed.json");
        assert_eq!(session.state, SessionState::Completed);
        assert_eq!(session.plan.object_size(), 0);
        assert!(!session.is_resumable_with(&session.source_digest));
    }

    #[test]
    fn part_tokens_follow_index_order() {
        let session: Session = roundtrip_test("session_upload.json");
        let tokens = session.part_tokens();
        let indices: Vec<u32> = tokens.iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(tokens[0].etag, "\"5f70bf18a086007016e948b04aed3b82\"");
    }

    #[test]
    fn resumable_only_with_matching_source() {
        let session: Session = roundtrip_test("session_upload.json");
        assert!(session.is_resumable_with(
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        ));
        assert!(!session.is_resumable_with("0000"));
    }

    #[test]
    fn record_file_names_are_stable() {
        let upload: Session = roundtrip_test("session_upload.json");
        let download: Session = roundtrip_test("session_download.json");
        assert_eq!(
            upload.key.storage_name(),
            "20179c4ab2b58611fdc7c2895f170ee06cd9882625e01db15436d5e8e03f3998"
        );
        assert_eq!(
            download.key.storage_name(),
            "8fab74402977f6f0eb5b9268d9b5076f50eda548e94a47d2a083d88d770468f8"
        );
    }

    #[test]
    fn store_reads_fixture_records() {
        let dir = tempfile::tempdir().unwrap();
        let session: Session = roundtrip_test("session_upload.json");
        fs::copy(
            fixtures_dir().join("session_upload.json"),
            dir.path().join(format!("{}.json", session.key.storage_name())),
        )
        .unwrap();

        let store = SessionStore::new(dir.path()).unwrap();
        let loaded = store.load(&session.key).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let mut fixture = load_fixture("session_upload.json");
        fixture["state"] = serde_json::json!("paused");
        assert!(serde_json::from_value::<Session>(fixture).is_err());
    }
}
