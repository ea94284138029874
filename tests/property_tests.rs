//! Property-based tests for linkdrop
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Chunked Storage Properties
// ============================================================================

mod storage_properties {
    use super::*;
    use linkdrop_files::{FileReader, FileStore, FileWriter, MemoryFileStore, NewFile};
    use std::sync::Arc;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    /// Write `data` in `chunk`-sized pieces, commit, and read it back
    async fn store_and_read(data: &[u8], chunk: usize, page_size: usize) -> (Vec<u8>, u64) {
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let ids = store
            .create_entries(vec![NewFile {
                name: "blob".into(),
                size: data.len() as u64,
                mime_type: "application/octet-stream".into(),
                owner: "peer".into(),
            }])
            .await
            .unwrap();

        let mut writer = FileWriter::new(Arc::clone(&store), ids[0], page_size);
        for piece in data.chunks(chunk) {
            writer.write(piece).await.unwrap();
        }
        let written = writer.finish().await.unwrap();

        let mut reader = FileReader::open(store, ids[0]).await.unwrap();
        (reader.read_to_end().await.unwrap(), written)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Content survives any combination of chunk and page size
        #[test]
        fn pages_reassemble_content(
            data in prop::collection::vec(any::<u8>(), 0..8192),
            chunk in 1usize..2048,
            page_size in 1usize..4096,
        ) {
            let (read, written) = runtime().block_on(store_and_read(&data, chunk, page_size));
            prop_assert_eq!(written, data.len() as u64);
            prop_assert_eq!(read, data);
        }

        /// A committed entry lists once with its announced size
        #[test]
        fn committed_entry_is_listed(len in 0usize..4096, page_size in 1usize..1024) {
            runtime().block_on(async {
                let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
                let ids = store
                    .create_entries(vec![NewFile {
                        name: "x".into(),
                        size: len as u64,
                        mime_type: "text/plain".into(),
                        owner: "peer".into(),
                    }])
                    .await
                    .unwrap();
                prop_assert!(store.list().await.unwrap().is_empty());

                let mut writer = FileWriter::new(Arc::clone(&store), ids[0], page_size);
                writer.write(&vec![7u8; len]).await.unwrap();
                writer.finish().await.unwrap();

                let records = store.list().await.unwrap();
                prop_assert_eq!(records.len(), 1);
                prop_assert_eq!(records[0].size, len as u64);
                Ok(())
            })?;
        }
    }
}

// ============================================================================
// Link Code Properties
// ============================================================================

mod code_properties {
    use super::*;
    use linkdrop_registry::LinkCode;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    proptest! {
        /// Generated codes are valid and never contain zero
        #[test]
        fn generated_codes_parse(seed in any::<u64>()) {
            let code = LinkCode::generate_with(&mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(code.as_str().len(), 4);
            prop_assert!(!code.as_str().contains('0'));
            prop_assert!(LinkCode::parse(code.as_str()).is_ok());
        }

        /// Parsing accepts exactly four uppercase letters or digits
        #[test]
        fn parse_matches_pattern(input in "\\PC{0,6}") {
            let valid = input.len() == 4
                && input.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
            prop_assert_eq!(LinkCode::parse(&input).is_ok(), valid);
        }
    }
}

// ============================================================================
// Addressing Properties
// ============================================================================

mod addressing_properties {
    use super::*;
    use linkdrop_core::client::parse_share_path;
    use linkdrop_core::protocol::{channel_label, file_name_from_label};

    proptest! {
        /// Well-formed share paths split into id and code
        #[test]
        fn share_path_splits(id in "[A-Za-z0-9-]{1,40}", code in "[0-9a-z]{1,7}") {
            let (public_id, parsed) = parse_share_path(&format!("{id}/{code}")).unwrap();
            prop_assert_eq!(public_id.as_str(), id.as_str());
            prop_assert_eq!(parsed, code);
        }

        /// Codes with anything but lowercase alphanumerics are rejected
        #[test]
        fn share_path_rejects_bad_codes(id in "[a-z0-9]{1,20}", code in "[0-9a-z]{0,3}[A-Z_.][0-9a-z]{0,3}") {
            let path = format!("{id}/{code}");
            prop_assert!(parse_share_path(&path).is_err());
        }

        /// Any file name, slashes and colons included, survives the label
        #[test]
        fn channel_label_carries_name(name in "\\PC{0,64}") {
            let label = channel_label(&name);
            prop_assert_eq!(file_name_from_label(&label), Some(name.as_str()));
        }
    }
}
