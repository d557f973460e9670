#[cfg(test)]
pub(crate) mod restore_tests {
    use crate::config::StorageConfig;
    use crate::coordinator::CheckpointStorageCoordinator;
    use crate::error::Error;
    use crate::handle::StateHandle;
    use crate::storage::METADATA_FILE_NAME;
    use crate::testing::utils::{pending_for, write_state};
    use crate::types::{JobId, StateScope};
    use std::path::Path;
    use tempfile::tempdir;
    use test_log::test;

    fn fs_job(base: &Path, job_id: JobId, max_retained: usize) -> CheckpointStorageCoordinator {
        let config = StorageConfig::new(base)
            .with_job_id(job_id)
            .with_file_size_threshold(1024)
            .with_max_retained_checkpoints(max_retained);
        CheckpointStorageCoordinator::new(config).unwrap()
    }

    fn complete(
        coordinator: &CheckpointStorageCoordinator,
        checkpoint_id: u64,
        handles: Vec<StateHandle>,
    ) -> String {
        let location = coordinator
            .location(checkpoint_id)
            .expect("location must be open");
        coordinator
            .finalize(&location, pending_for(checkpoint_id, handles))
            .unwrap()
            .external_pointer()
            .to_string()
    }

    #[test]
    fn test_inline_state_round_trips_in_memory() {
        let coordinator = CheckpointStorageCoordinator::new(StorageConfig::in_memory()).unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let location = coordinator.create_checkpoint_location(1).unwrap();
        let handle = write_state(&location, StateScope::Exclusive, &payload);
        assert!(handle.is_inline());
        let pointer = complete(&coordinator, 1, vec![handle]);

        let metadata = coordinator.resolve_pointer(&pointer).unwrap();
        let restored: Vec<&StateHandle> = metadata.handles().collect();
        assert_eq!(restored.len(), 1);
        assert_eq!(
            coordinator.read_state(restored[0]).unwrap().as_ref(),
            payload.as_slice()
        );
    }

    #[test]
    fn test_inline_and_file_state_round_trip_on_fs() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);

        let location = coordinator.create_checkpoint_location(4).unwrap();
        let small = write_state(&location, StateScope::Exclusive, b"offset=42");
        let large = write_state(&location, StateScope::Shared, &[5u8; 64 * 1024]);
        assert!(small.is_inline());
        assert!(!large.is_inline());
        let pointer = complete(&coordinator, 4, vec![small.clone(), large.clone()]);

        let metadata = coordinator.resolve_pointer(&pointer).unwrap();
        assert_eq!(metadata.checkpoint_id, 4);
        assert_eq!(metadata.total_size(), small.size_bytes() + large.size_bytes());
        for handle in metadata.handles() {
            let expected = if handle.id() == small.id() {
                b"offset=42".to_vec()
            } else {
                vec![5u8; 64 * 1024]
            };
            assert_eq!(coordinator.read_state(handle).unwrap().as_ref(), expected.as_slice());
        }
    }

    #[test]
    fn test_pointer_to_checkpoint_directory_resolves() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);
        let location = coordinator.create_checkpoint_location(2).unwrap();
        let handle = write_state(&location, StateScope::Exclusive, b"state");
        let pointer = complete(&coordinator, 2, vec![handle]);

        let chk_dir = Path::new(&pointer).parent().unwrap().display().to_string();
        assert_eq!(coordinator.resolve_pointer(&chk_dir).unwrap().checkpoint_id, 2);
    }

    #[test]
    fn test_corrupt_metadata_is_reported() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);
        let location = coordinator.create_checkpoint_location(1).unwrap();
        let handle = write_state(&location, StateScope::Exclusive, b"state");
        let pointer = complete(&coordinator, 1, vec![handle]);

        let mut bytes = std::fs::read(&pointer).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xFF;
        std::fs::write(&pointer, &bytes).unwrap();
        assert!(matches!(
            coordinator.resolve_pointer(&pointer),
            Err(Error::CorruptMetadata { .. })
        ));

        std::fs::write(&pointer, &bytes[..10]).unwrap();
        assert!(matches!(
            coordinator.resolve_pointer(&pointer),
            Err(Error::CorruptMetadata { .. })
        ));
        assert_eq!(coordinator.metrics().errors.get("corrupt_metadata"), 2);
    }

    #[test]
    fn test_damaged_metadata_header_is_reported() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);
        let location = coordinator.create_checkpoint_location(1).unwrap();
        let handle = write_state(&location, StateScope::Exclusive, b"state");
        let pointer = complete(&coordinator, 1, vec![handle]);
        let original = std::fs::read(&pointer).unwrap();

        // checkpoint id, timestamp, operator count, data size
        for range in [12..20, 20..28, 28..36, 36..44] {
            let mut bytes = original.clone();
            for b in &mut bytes[range] {
                *b = 0xFF;
            }
            std::fs::write(&pointer, &bytes).unwrap();
            assert!(matches!(
                coordinator.resolve_pointer(&pointer),
                Err(Error::CorruptMetadata { .. })
            ));
        }

        std::fs::write(&pointer, &original).unwrap();
        assert_eq!(coordinator.resolve_pointer(&pointer).unwrap().checkpoint_id, 1);
    }

    #[test]
    fn test_missing_pointer_is_not_found() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);
        let missing = dir.path().join("chk-99").join(METADATA_FILE_NAME);

        assert!(matches!(
            coordinator.resolve_pointer(&missing.display().to_string()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            coordinator.restore_checkpoint("not a pointer"),
            Err(Error::NotFound(_))
        ));
        assert!(coordinator.retained_checkpoints().is_empty());
    }

    #[test]
    fn test_tampered_state_file_is_corrupt_state() {
        let dir = tempdir().unwrap();
        let coordinator = fs_job(dir.path(), JobId::new(), 1);
        let location = coordinator.create_checkpoint_location(1).unwrap();
        let handle = write_state(&location, StateScope::Exclusive, &[3u8; 4096]);
        complete(&coordinator, 1, vec![handle.clone()]);

        let path = handle.file_path().unwrap();
        let mut bytes = std::fs::read(path).unwrap();
        bytes[0] ^= 0x01;
        std::fs::write(path, &bytes).unwrap();

        assert!(matches!(
            coordinator.read_state(&handle),
            Err(Error::CorruptState { .. })
        ));
    }

    /// A restarted job restores checkpoint 1 and keeps building on its
    /// shared state.
    #[test]
    fn test_restored_shared_state_is_kept_until_unreferenced() {
        let dir = tempdir().unwrap();
        let job_id = JobId::new();

        let pointer = {
            let previous = fs_job(dir.path(), job_id, 1);
            let location = previous.create_checkpoint_location(1).unwrap();
            let h = write_state(&location, StateScope::Shared, &[1u8; 4096]);
            let e = write_state(&location, StateScope::Exclusive, &[2u8; 4096]);
            complete(&previous, 1, vec![h, e])
        };

        let coordinator = fs_job(dir.path(), job_id, 1);
        let metadata = coordinator.restore_checkpoint(&pointer).unwrap();
        assert_eq!(coordinator.retained_checkpoints(), vec![1]);
        assert_eq!(coordinator.metrics().snapshot().checkpoints_restored, 1);

        let h = metadata
            .handles_in_scope(StateScope::Shared)
            .next()
            .cloned()
            .unwrap();
        let e = metadata
            .handles_in_scope(StateScope::Exclusive)
            .next()
            .cloned()
            .unwrap();
        assert_eq!(coordinator.retention().registry().ref_count(h.id()), 1);

        // Checkpoint 2 reuses H and subsumes the restored checkpoint.
        coordinator.create_checkpoint_location(2).unwrap();
        complete(&coordinator, 2, vec![h.clone()]);
        assert_eq!(coordinator.retained_checkpoints(), vec![2]);
        assert!(h.file_path().unwrap().exists());
        assert!(!e.file_path().unwrap().exists());
        assert!(matches!(
            coordinator.resolve_pointer(&pointer),
            Err(Error::NotFound(_))
        ));

        // Checkpoint 3 no longer needs H.
        let location = coordinator.create_checkpoint_location(3).unwrap();
        let fresh = write_state(&location, StateScope::Shared, &[4u8; 4096]);
        complete(&coordinator, 3, vec![fresh]);
        assert!(!h.file_path().unwrap().exists());
    }

    #[test]
    fn test_restoring_twice_is_rejected() {
        let coordinator = CheckpointStorageCoordinator::new(StorageConfig::in_memory()).unwrap();
        coordinator.create_checkpoint_location(1).unwrap();
        let pointer = complete(&coordinator, 1, Vec::new());

        assert!(matches!(
            coordinator.restore_checkpoint(&pointer),
            Err(Error::AlreadyRegistered(1))
        ));
        assert_eq!(coordinator.latest_checkpoint().unwrap().checkpoint_id, 1);
    }
}
