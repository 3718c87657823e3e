
use crate::traits::UiAssetProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// A UI asset provider that reads files from a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskFrontend {
    root: PathBuf,
}

impl DiskFrontend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a request path onto the UI directory. Only plain relative
    /// components are accepted, so nothing outside `root` is reachable.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut out = self.root.clone();
        let mut any = false;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    any = true;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        any.then_some(out)
    }
}

#[async_trait]
impl UiAssetProvider for DiskFrontend {
    async fn get_asset(&self, path: &str) -> Result<(Cow<'static, [u8]>, String)> {
        let asset_path = self
            .resolve(path)
            .ok_or_else(|| Error::AssetNotFound(path.to_string()))?;

        let content = fs::read(&asset_path)
            .await
            .map_err(|_| Error::AssetNotFound(path.to_string()))?;

        // Guess the MIME type based on the file extension
        let mime = mime_guess::from_path(&asset_path)
            .first_or_octet_stream()
            .to_string();

        Ok((Cow::Owned(content), mime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ui_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();
        std::fs::create_dir(dir.path().join("i18n")).unwrap();
        std::fs::write(dir.path().join("i18n").join("en.json"), "{}").unwrap();
        dir
    }

    #[tokio::test]
    async fn serves_files_with_mime() {
        let dir = ui_dir();
        let frontend = DiskFrontend::new(dir.path());

        let (data, mime) = frontend.get_asset("index.html").await.unwrap();
        assert_eq!(&data[..], b"<html></html>");
        assert_eq!(mime, "text/html");

        let (_, mime) = frontend.get_asset("/i18n/en.json").await.unwrap();
        assert_eq!(mime, "application/json");
    }

    #[tokio::test]
    async fn rejects_traversal_and_missing_files() {
        let dir = ui_dir();
        let frontend = DiskFrontend::new(dir.path().join("i18n"));

        assert!(matches!(
            frontend.get_asset("../index.html").await,
            Err(Error::AssetNotFound(_))
        ));
        assert!(matches!(
            frontend.get_asset("missing.css").await,
            Err(Error::AssetNotFound(_))
        ));
        assert!(matches!(frontend.get_asset("").await, Err(Error::AssetNotFound(_))));
    }
}
