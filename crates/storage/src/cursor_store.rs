use std::io::ErrorKind;

use chain_notify_domain::storage::{BlockCursor, CursorError, CursorResult};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::FileCursor;

#[async_trait::async_trait]
impl BlockCursor for FileCursor {
    async fn load(&self) -> CursorResult<Option<u64>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CursorError::Corrupt(trimmed.to_string()))
    }

    async fn save(&self, height: u64) -> CursorResult<()> {
        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).await?;
        file.write_all(height.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &self.path).await?;
        debug!(height, path = %self.path.display(), "block cursor saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_path() -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "chain-notify-cursor-{}-{n}.height",
            std::process::id()
        ))
    }

    #[tokio::test]
    async fn missing_file_means_no_cursor() {
        let cursor = FileCursor::new(scratch_path());
        assert_eq!(cursor.load().await.expect("load succeeds"), None);
    }

    #[tokio::test]
    async fn saved_height_survives_reopen() {
        let path = scratch_path();
        let cursor = FileCursor::new(&path);
        cursor.save(41).await.expect("first save");
        cursor.save(42).await.expect("second save");

        let reopened = FileCursor::new(&path);
        assert_eq!(reopened.load().await.expect("load"), Some(42));
        assert_eq!(
            std::fs::read_to_string(&path).expect("file readable"),
            "42"
        );
        assert!(!cursor.temp_path().exists());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn garbage_contents_are_reported() {
        let path = scratch_path();
        std::fs::write(&path, "not-a-height").expect("seed file");

        let err = FileCursor::new(&path).load().await.unwrap_err();
        assert!(matches!(err, CursorError::Corrupt(ref raw) if raw == "not-a-height"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn surrounding_whitespace_is_tolerated() {
        let path = scratch_path();
        std::fs::write(&path, "1200\n").expect("seed file");

        assert_eq!(FileCursor::new(&path).load().await.expect("load"), Some(1200));
        let _ = std::fs::remove_file(&path);
    }
}
