#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cfsync::sync::{map_event, FileEvent, EventKind};
    use cfsync::transport::{Content, RemoteTransport};
    use cfsync::{Result, SyncIgnore, SyncOptions, SyncSession};
    use notify::event::{ModifyKind, RenameMode};
    use notify::Event;
    use parking_lot::Mutex;
    use std::fs;
    use std::io::Read;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        CopyRemoteFolder(PathBuf, String),
        CopyContent(String, Vec<u8>),
        CreateFolders(String, String),
        Delete(String),
        Rename(String, String),
    }

    /// Stands in for the container: records calls, and the initial pull
    /// materialises a fixed remote tree (`a/b.txt`).
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn clear(&self) {
            self.calls.lock().clear();
        }
    }

    #[async_trait]
    impl RemoteTransport for RecordingTransport {
        async fn copy_remote_folder(&self, local_root: &Path, remote_root: &str) -> Result<()> {
            fs::create_dir_all(local_root.join("a"))?;
            fs::write(local_root.join("a").join("b.txt"), b"remote")?;
            self.calls.lock().push(Call::CopyRemoteFolder(
                local_root.to_path_buf(),
                remote_root.to_string(),
            ));
            Ok(())
        }

        async fn copy_content(
            &self,
            mut content: Content,
            size: u64,
            remote_path: &str,
            _mode: u32,
        ) -> Result<()> {
            let mut data = Vec::new();
            content.read_to_end(&mut data)?;
            assert_eq!(data.len() as u64, size);
            self.calls
                .lock()
                .push(Call::CopyContent(remote_path.to_string(), data));
            Ok(())
        }

        async fn create_folders(&self, remote_root: &str, relative_dir: &str) -> Result<()> {
            self.calls.lock().push(Call::CreateFolders(
                remote_root.to_string(),
                relative_dir.to_string(),
            ));
            Ok(())
        }

        async fn delete(&self, remote_path: &str) -> Result<()> {
            self.calls.lock().push(Call::Delete(remote_path.to_string()));
            Ok(())
        }

        async fn rename(&self, old_remote_path: &str, new_remote_path: &str) -> Result<()> {
            self.calls.lock().push(Call::Rename(
                old_remote_path.to_string(),
                new_remote_path.to_string(),
            ));
            Ok(())
        }
    }

    fn local_root(temp: &TempDir) -> PathBuf {
        temp.path().canonicalize().unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_event_sequence() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        let transport = Arc::new(RecordingTransport::default());
        let mut session =
            SyncSession::new(transport.clone(), &root, "app", SyncOptions::default())?;

        // empty root: one pull
        assert!(session.sync_folder().await?);
        assert_eq!(
            transport.calls(),
            vec![Call::CopyRemoteFolder(root.clone(), "app".to_string())]
        );
        assert!(root.join("a/b.txt").exists());
        transport.clear();

        // create c.txt
        fs::write(root.join("c.txt"), b"hello")?;
        session
            .handle_event(FileEvent::new(EventKind::Create, root.join("c.txt")))
            .await?;
        assert_eq!(
            transport.calls(),
            vec![Call::CopyContent("app/c.txt".to_string(), b"hello".to_vec())]
        );
        transport.clear();

        // delete c.txt
        fs::remove_file(root.join("c.txt"))?;
        session
            .handle_event(FileEvent::new(EventKind::Remove, root.join("c.txt")))
            .await?;
        assert_eq!(transport.calls(), vec![Call::Delete("app/c.txt".to_string())]);
        transport.clear();

        // rename a.txt -> d.txt, as reported by the watcher
        fs::write(root.join("d.txt"), b"moved")?;
        let rename = Event::new(notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(root.join("a.txt"))
            .add_path(root.join("d.txt"));
        for event in map_event(rename) {
            session.handle_event(event).await?;
        }
        assert_eq!(
            transport.calls(),
            vec![Call::Rename("app/a.txt".to_string(), "app/d.txt".to_string())]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_populated_root_skips_pull() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        fs::write(root.join("keep.txt"), b"local")?;

        let transport = Arc::new(RecordingTransport::default());
        let session = SyncSession::new(transport.clone(), &root, "app", SyncOptions::default())?;
        assert!(!session.sync_folder().await?);
        assert!(transport.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_ignore_file_suppresses_events() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        fs::write(root.join(".syncignore"), "node_modules/\n*.tmp\n")?;
        let cwd = TempDir::new()?;
        let ignore = SyncIgnore::load_from(&root, "~/app", ".syncignore", cwd.path())?;

        let transport = Arc::new(RecordingTransport::default());
        let options = SyncOptions {
            ignore: Arc::new(ignore),
            ..SyncOptions::default()
        };
        let mut session = SyncSession::new(transport.clone(), &root, "~/app", options)?;

        fs::create_dir_all(root.join("node_modules/pkg"))?;
        fs::write(root.join("node_modules/pkg/index.js"), b"x")?;
        fs::write(root.join("build.tmp"), b"x")?;
        fs::write(root.join("main.go"), b"package main")?;

        for name in ["node_modules/pkg/index.js", "build.tmp", "main.go"] {
            session
                .handle_event(FileEvent::new(EventKind::Write, root.join(name)))
                .await?;
        }
        assert_eq!(
            transport.calls(),
            vec![Call::CopyContent(
                "~/app/main.go".to_string(),
                b"package main".to_vec()
            )]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_first_run_with_ignore_file_in_working_dir_still_pulls() -> anyhow::Result<()> {
        // same order as the binary: ignore file, session, bootstrap
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        let cwd = TempDir::new()?;
        fs::write(cwd.path().join(".syncignore"), "node_modules/\n")?;

        let ignore = SyncIgnore::load_from(&root, "~/app", ".syncignore", cwd.path())?;
        assert!(root.join(".syncignore").is_file());

        let transport = Arc::new(RecordingTransport::default());
        let options = SyncOptions {
            ignore: Arc::new(ignore),
            ..SyncOptions::default()
        };
        let session = SyncSession::new(transport.clone(), &root, "~/app", options)?;
        assert!(session.sync_folder().await?);
        assert_eq!(
            transport.calls(),
            vec![Call::CopyRemoteFolder(root.clone(), "~/app".to_string())]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_live_session_deletes_file_moved_out_of_tree() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        let outside = TempDir::new()?;
        fs::write(root.join("gone.txt"), b"bye")?;

        let transport = Arc::new(RecordingTransport::default());
        let session = SyncSession::new(transport.clone(), &root, "app", SyncOptions::default())?;
        let cancel = CancellationToken::new();
        let running = tokio::spawn(session.run(cancel.clone()));

        // populated root: no pull, just let the watcher register
        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::rename(root.join("gone.txt"), outside.path().join("gone.txt"))?;

        let deleted = wait_for(&transport, |calls| {
            calls.contains(&Call::Delete("app/gone.txt".to_string()))
        })
        .await;

        cancel.cancel();
        running.await??;
        assert!(deleted, "calls: {:?}", transport.calls());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_live_session_mirrors_new_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let root = local_root(&temp);
        let transport = Arc::new(RecordingTransport::default());
        let session = SyncSession::new(transport.clone(), &root, "app", SyncOptions::default())?;

        let cancel = CancellationToken::new();
        let running = tokio::spawn(session.run(cancel.clone()));

        // wait for the bootstrap pull before touching the tree
        let pulled = wait_for(&transport, |calls| !calls.is_empty()).await;
        assert!(pulled, "bootstrap pull never happened");
        // give the watcher a moment to register
        tokio::time::sleep(Duration::from_millis(200)).await;

        fs::write(root.join("live.txt"), b"live")?;
        let uploaded = wait_for(&transport, |calls| {
            calls
                .iter()
                .any(|c| matches!(c, Call::CopyContent(remote, _) if remote == "app/live.txt"))
        })
        .await;

        cancel.cancel();
        running.await??;
        assert!(uploaded, "calls: {:?}", transport.calls());

        // only uploads of the new file follow the pull
        for call in transport.calls().into_iter().skip(1) {
            assert!(
                matches!(&call, Call::CopyContent(remote, _) if remote == "app/live.txt"),
                "unexpected call {:?}",
                call
            );
        }
        Ok(())
    }

    async fn wait_for(
        transport: &RecordingTransport,
        done: impl Fn(&[Call]) -> bool,
    ) -> bool {
        for _ in 0..100 {
            if done(&transport.calls()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }
}
