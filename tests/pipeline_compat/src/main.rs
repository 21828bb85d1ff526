fn main() {
    println!("Run `cargo test -p pipeline-compat` to execute pipeline end-to-end tests.");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use cumulus_archive::ArchiveGenerator;
    use cumulus_protocol::{
        BlockList, BlockRef, ChildLink, LinkKind, LinkRef, NestedChild, Transfer, TransferMeta,
        TransferState, UploadSlot,
    };
    use cumulus_queue::{TransferManager, TransferQueue, QueueError};
    use cumulus_transfer::{
        ApiError, ApiFuture, CryptoError, CryptoProvider, FileDraft, FileUploader, RetryConfig,
        SaveSink, SavedContent, StorageApi, TransferEnv, TransferEvent, UploadRequest,
        block_digest,
    };
    use cumulus_tree::{FolderTreeLoader, LinkIterator, TreeCallbacks};

    // -----------------------------------------------------------------------
    // Mock remote drive
    // -----------------------------------------------------------------------

    /// In-memory remote: a folder tree with per-file content, plus upload
    /// recording. Content is served unencrypted (identity crypto below).
    struct MockDrive {
        children: HashMap<String, Vec<ChildLink>>,
        content: HashMap<String, Vec<u8>>,
        stored_blocks: Mutex<Vec<(u32, Vec<u8>)>>,
        commits: Mutex<u32>,
    }

    impl MockDrive {
        /// Photos/ { beach.jpg(8), Albums/ { 2024/ { ski.jpg(6) }, cover.png(4) } }
        fn sample() -> Self {
            let mut children = HashMap::new();
            let mut content = HashMap::new();

            children.insert(
                "root".to_string(),
                vec![
                    file_link("beach", "beach.jpg", 8),
                    folder_link("albums", "Albums"),
                ],
            );
            children.insert(
                "albums".to_string(),
                vec![
                    folder_link("y2024", "2024"),
                    file_link("cover", "cover.png", 4),
                ],
            );
            children.insert(
                "y2024".to_string(),
                vec![file_link("ski", "ski.jpg", 6)],
            );

            content.insert("rev-beach".to_string(), b"BEACHJPG".to_vec());
            content.insert("rev-cover".to_string(), b"PNG0".to_vec());
            content.insert("rev-ski".to_string(), b"SKIJPG".to_vec());

            Self {
                children,
                content,
                stored_blocks: Mutex::new(Vec::new()),
                commits: Mutex::new(0),
            }
        }
    }

    fn file_link(id: &str, name: &str, size: u64) -> ChildLink {
        ChildLink {
            link: LinkRef::new("s1", id),
            name: name.into(),
            kind: LinkKind::File,
            size,
            mime_type: String::new(),
            revision_id: format!("rev-{id}"),
            signature_issue: None,
        }
    }

    fn folder_link(id: &str, name: &str) -> ChildLink {
        ChildLink {
            link: LinkRef::new("s1", id),
            name: name.into(),
            kind: LinkKind::Folder,
            size: 0,
            mime_type: String::new(),
            revision_id: String::new(),
            signature_issue: None,
        }
    }

    impl StorageApi for MockDrive {
        fn get_blocks(
            &self,
            _link: &LinkRef,
            revision_id: &str,
            _from_index: u32,
        ) -> ApiFuture<'_, BlockList> {
            let data = self.content.get(revision_id).cloned().unwrap_or_default();
            let revision_id = revision_id.to_string();
            Box::pin(async move {
                let blocks = if data.is_empty() {
                    vec![]
                } else {
                    vec![BlockRef {
                        index: 0,
                        url: format!("block:{revision_id}"),
                        token: "tok".into(),
                        hash: block_digest(&data),
                        size: data.len() as u64,
                    }]
                };
                Ok(BlockList {
                    blocks,
                    thumbnail_hashes: vec![],
                    manifest_signature: String::new(),
                    xattrs: None,
                    has_more: false,
                })
            })
        }

        fn download_block(&self, url: &str, _token: &str) -> ApiFuture<'_, Vec<u8>> {
            let data = url
                .strip_prefix("block:")
                .and_then(|rev| self.content.get(rev))
                .cloned();
            Box::pin(async move { data.ok_or_else(|| ApiError::not_found("no such block")) })
        }

        fn request_upload(
            &self,
            _link: &LinkRef,
            _revision_id: &str,
            block_hashes: &[Vec<u8>],
        ) -> ApiFuture<'_, Vec<UploadSlot>> {
            let slots: Vec<UploadSlot> = (0..block_hashes.len() as u32)
                .map(|index| UploadSlot {
                    index,
                    url: format!("put:{index}"),
                    token: "tok".into(),
                })
                .collect();
            Box::pin(async move { Ok(slots) })
        }

        fn upload_block(&self, slot: &UploadSlot, data: Vec<u8>) -> ApiFuture<'_, ()> {
            self.stored_blocks.lock().unwrap().push((slot.index, data));
            Box::pin(async { Ok(()) })
        }

        fn create_file(
            &self,
            _share_id: &str,
            _parent_id: &str,
            _encrypted_name: &str,
            _name_hash: &str,
        ) -> ApiFuture<'_, FileDraft> {
            Box::pin(async {
                Ok(FileDraft {
                    link: LinkRef::new("s1", "uploaded"),
                    revision_id: "rev-up".into(),
                })
            })
        }

        fn create_revision(&self, _link: &LinkRef) -> ApiFuture<'_, String> {
            Box::pin(async { Ok("rev-next".to_string()) })
        }

        fn commit_revision(
            &self,
            _link: &LinkRef,
            _revision_id: &str,
            _manifest_signature: &str,
        ) -> ApiFuture<'_, ()> {
            *self.commits.lock().unwrap() += 1;
            Box::pin(async { Ok(()) })
        }

        fn delete_revision(&self, _link: &LinkRef, _revision_id: &str) -> ApiFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn get_children(&self, link: &LinkRef) -> ApiFuture<'_, Vec<ChildLink>> {
            let children = self.children.get(&link.link_id).cloned().unwrap_or_default();
            Box::pin(async move {
                // Simulate a listing round-trip so consumers interleave.
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(children)
            })
        }
    }

    /// Identity crypto: the pipeline treats content as opaque either way.
    struct PlainCrypto;

    impl CryptoProvider for PlainCrypto {
        fn session_key(&self, _link: &LinkRef) -> Result<Vec<u8>, CryptoError> {
            Ok(Vec::new())
        }

        fn encrypt_name(&self, _parent: &LinkRef, name: &str) -> Result<String, CryptoError> {
            Ok(name.to_string())
        }

        fn lookup_hash(&self, _parent: &LinkRef, name: &str) -> Result<String, CryptoError> {
            Ok(name.to_string())
        }

        fn decrypt_block(
            &self,
            _session_key: &[u8],
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, CryptoError> {
            Ok(ciphertext.to_vec())
        }

        fn encrypt_block(
            &self,
            _session_key: &[u8],
            plaintext: &[u8],
        ) -> Result<Vec<u8>, CryptoError> {
            Ok(plaintext.to_vec())
        }

        fn verify_manifest(
            &self,
            _link: &LinkRef,
            _manifest_signature: &str,
            _block_hashes: &[Vec<u8>],
        ) -> Result<(), CryptoError> {
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn folder_transfer(name: &str, root: &str) -> Transfer {
        Transfer::new_download(
            TransferMeta {
                filename: name.into(),
                mime_type: "application/x-tar".into(),
                size: None,
            },
            vec![LinkRef::new("s1", root)],
        )
    }

    fn test_env(api: Arc<MockDrive>) -> TransferEnv {
        let (env, _online) = TransferEnv::new(api, Arc::new(PlainCrypto));
        TransferEnv {
            retry: RetryConfig::immediate(),
            ..env
        }
    }

    fn read_tar(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        use std::io::Read;

        let mut reader = tar::Archive::new(archive);
        let mut entries = Vec::new();
        for entry in reader.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            entries.push((path, content));
        }
        entries
    }

    // -----------------------------------------------------------------------
    // End-to-end: folder download into a tar archive
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn folder_download_end_to_end() {
        let api = Arc::new(MockDrive::sample());
        let env = test_env(Arc::clone(&api));
        let queue = TransferQueue::new();
        let manager = TransferManager::new(queue.clone());

        let id = queue.add(folder_transfer("Photos", "root")).unwrap();
        assert_eq!(
            queue.find(&id).unwrap().state,
            TransferState::Initializing
        );

        // Name resolved; ready for admission.
        queue.update_state(cumulus_queue::by_id(&id), TransferState::Pending);
        let (admitted, control) = manager.admit_next().unwrap();
        assert_eq!(admitted, id);

        // Traversal feeds the iterator while sizes aggregate in parallel.
        let cancel = control.token();
        let (loader, children_rx) = FolderTreeLoader::new(
            Arc::clone(&api) as Arc<dyn StorageApi>,
            cancel.clone(),
        );
        let root = LinkRef::new("s1", "root");
        let scan_task = tokio::spawn(async move {
            let scan = loader
                .load(&root, "Photos", &TreeCallbacks::default())
                .await;
            drop(loader);
            scan
        });

        // Per-file progress flows into the manager's stats.
        let (events_tx, mut events_rx) = mpsc::channel(256);
        let progress_manager = manager.clone();
        let progress_id = id.clone();
        let progress_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let TransferEvent::Progress { bytes, .. } = event {
                    progress_manager.record_progress(&progress_id, bytes);
                }
            }
        });

        let iterator = LinkIterator::new(env, control.clone());
        let started_rx = iterator.iterate(children_rx, id.clone(), events_tx);

        let mut sink = SaveSink::in_memory();
        let generator = ArchiveGenerator::new(cancel.clone());
        let summary = generator.write(started_rx, &mut sink).await.unwrap();

        let scan = scan_task.await.unwrap().unwrap();
        progress_task.await.unwrap();

        // Aggregate size resolved independently of the entry stream.
        assert_eq!(scan.total_size, 18);
        assert_eq!(scan.size_by_link.get("albums"), Some(&10));

        queue.update_with_data(
            cumulus_queue::by_id(&id),
            TransferState::Done,
            cumulus_queue::TransferUpdate {
                size: Some(scan.total_size),
                ..Default::default()
            },
        );

        assert_eq!(summary.files, 3);
        assert_eq!(summary.folders, 2);
        assert_eq!(summary.content_bytes, 18);

        let SavedContent::Memory(archive) = sink.finish().unwrap() else {
            panic!("small archive should be buffered");
        };
        let mut entries = read_tar(&archive);
        entries.sort();
        assert_eq!(
            entries,
            vec![
                ("Photos/Albums/".to_string(), vec![]),
                ("Photos/Albums/2024/".to_string(), vec![]),
                ("Photos/Albums/2024/ski.jpg".to_string(), b"SKIJPG".to_vec()),
                ("Photos/Albums/cover.png".to_string(), b"PNG0".to_vec()),
                ("Photos/beach.jpg".to_string(), b"BEACHJPG".to_vec()),
            ]
        );

        let t = queue.find(&id).unwrap();
        assert_eq!(t.state, TransferState::Done);
        assert_eq!(t.meta.size, Some(18));
        assert_eq!(manager.stats(&id).progress, 18);
    }

    #[tokio::test]
    async fn duplicate_folder_download_is_rejected_while_in_flight() {
        let queue = TransferQueue::new();
        let id = queue.add(folder_transfer("Photos", "root")).unwrap();

        let err = queue
            .add(folder_transfer("Photos again", "root"))
            .unwrap_err();
        assert_eq!(err, QueueError::AlreadyInProgress);

        // Finished transfers stop blocking.
        queue.update_state(cumulus_queue::by_id(&id), TransferState::Done);
        queue.add(folder_transfer("Photos again", "root")).unwrap();
    }

    #[tokio::test]
    async fn cancelling_mid_pipeline_rejects_with_cancel_and_stops_streams() {
        let api = Arc::new(MockDrive::sample());
        let env = test_env(Arc::clone(&api));
        let queue = TransferQueue::new();
        let manager = TransferManager::new(queue.clone());

        let id = queue.add(folder_transfer("Photos", "root")).unwrap();
        queue.update_state(cumulus_queue::by_id(&id), TransferState::Pending);
        let (_, control) = manager.admit_next().unwrap();

        let cancel = control.token();
        let (loader, children_rx) = FolderTreeLoader::new(
            Arc::clone(&api) as Arc<dyn StorageApi>,
            cancel.clone(),
        );
        let root = LinkRef::new("s1", "root");
        let scan_task = tokio::spawn(async move {
            let scan = loader
                .load(&root, "Photos", &TreeCallbacks::default())
                .await;
            drop(loader);
            scan
        });

        let (events_tx, _events_rx) = mpsc::channel(256);
        let iterator = LinkIterator::new(env, control.clone());
        let started_rx = iterator.iterate(children_rx, id.clone(), events_tx);

        // Cancel almost immediately, while listings are still in flight.
        let killer = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                manager.cancel(&id);
            })
        };

        let mut sink = SaveSink::in_memory();
        let generator = ArchiveGenerator::new(cancel);
        let result = generator.write(started_rx, &mut sink).await;
        killer.await.unwrap();

        // The whole pipeline rejects with the cancellation error type.
        assert!(result.unwrap_err().is_cancel());
        // The traversal either finished before the cancel landed or aborted
        // with the same error type.
        if let Err(err) = scan_task.await.unwrap() {
            assert!(err.is_cancel());
        }
        assert_eq!(
            queue.find(&id).unwrap().state,
            TransferState::Canceled
        );
    }

    // -----------------------------------------------------------------------
    // End-to-end: upload
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn buffered_upload_end_to_end() {
        let api = Arc::new(MockDrive::sample());
        let env = test_env(Arc::clone(&api));
        let queue = TransferQueue::new();
        let manager = TransferManager::new(queue.clone());

        let transfer = Transfer::new_upload(
            TransferMeta {
                filename: "notes.txt".into(),
                mime_type: "text/plain".into(),
                size: Some(10),
            },
            "s1",
            Some("root".into()),
            true,
        );
        let id = queue.add(transfer).unwrap();

        // Buffered uploads bypass the load budget entirely.
        let (admitted, control) = manager.admit_next().unwrap();
        assert_eq!(admitted, id);

        let (events_tx, events_rx) = mpsc::channel(64);
        let applier = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.apply_events(events_rx).await })
        };

        let uploader = FileUploader::new(env, control);
        let request = UploadRequest {
            transfer_id: id.clone(),
            share_id: "s1".into(),
            parent: LinkRef::new("s1", "root"),
            name: "notes.txt".into(),
            mime_type: "text/plain".into(),
            data: b"0123456789".to_vec(),
            overwrite: None,
        };
        let summary = uploader.run(&request, &events_tx).await.unwrap();
        drop(events_tx);
        applier.await.unwrap();

        assert_eq!(summary.link.link_id, "uploaded");
        assert_eq!(summary.blocks, 1);
        assert_eq!(*api.commits.lock().unwrap(), 1);
        assert_eq!(api.stored_blocks.lock().unwrap().len(), 1);
        assert_eq!(
            api.stored_blocks.lock().unwrap()[0].1,
            b"0123456789".to_vec()
        );

        let t = queue.find(&id).unwrap();
        assert_eq!(t.state, TransferState::Done);
        assert_eq!(manager.stats(&id).progress, 10);
    }

    #[tokio::test]
    async fn children_stream_drives_downloads_before_scan_resolves() {
        let api = Arc::new(MockDrive::sample());
        let env = test_env(Arc::clone(&api));
        let control = cumulus_transfer::ControlHandle::new();

        let cancel = control.token();
        let (loader, children_rx) = FolderTreeLoader::new(
            Arc::clone(&api) as Arc<dyn StorageApi>,
            cancel,
        );

        let (events_tx, _events_rx) = mpsc::channel(256);
        let iterator = LinkIterator::new(env, control);
        let mut started_rx = iterator.iterate(children_rx, "t-live".into(), events_tx);

        let root = LinkRef::new("s1", "root");
        let load = tokio::spawn(async move {
            let scan = loader
                .load(&root, "Photos", &TreeCallbacks::default())
                .await;
            drop(loader);
            scan
        });

        // The first file is already downloadable while deeper listings run.
        let first = started_rx.recv().await.unwrap();
        assert_eq!(first.node.name, "beach.jpg");
        let mut content = Vec::new();
        let mut rx = first.content.unwrap();
        while let Some(chunk) = rx.recv().await {
            content.extend_from_slice(&chunk);
        }
        assert_eq!(content, b"BEACHJPG");

        while started_rx.recv().await.is_some() {}
        load.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nested_child_paths_follow_ancestor_chain() {
        let api = Arc::new(MockDrive::sample());
        let cancel = CancellationToken::new();
        let (loader, mut children_rx) = FolderTreeLoader::new(
            Arc::clone(&api) as Arc<dyn StorageApi>,
            cancel,
        );

        let collector = tokio::spawn(async move {
            let mut nodes: Vec<NestedChild> = Vec::new();
            while let Some(node) = children_rx.recv().await {
                nodes.push(node);
            }
            nodes
        });

        loader
            .load(
                &LinkRef::new("s1", "root"),
                "Photos",
                &TreeCallbacks::default(),
            )
            .await
            .unwrap();
        drop(loader);

        let nodes = collector.await.unwrap();
        let ski = nodes.iter().find(|n| n.name == "ski.jpg").unwrap();
        assert_eq!(ski.parent_path, vec!["Photos", "Albums", "2024"]);
        assert_eq!(ski.parent_link_ids, vec!["root", "albums", "y2024"]);
        assert_eq!(ski.archive_path(), "Photos/Albums/2024/ski.jpg");
    }
}
