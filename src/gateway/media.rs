//! 媒体上传
//!
//! 附件按内容哈希存放到媒体服务器或本地目录, 然后把下载链接写回 [`FileInfo`]。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sha1::{Digest, Sha1};

use crate::bridge::FileInfo;
use crate::config::GeneralConfig;

/// 存放文件的位置
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn put(&self, sha: &str, name: &str, data: &[u8]) -> anyhow::Result<()>;
}

/// 通过 http PUT 上传到媒体服务器
pub struct HttpMediaServer {
    client: reqwest::Client,
    upload: String,
}

impl HttpMediaServer {
    pub fn new(upload: &str) -> anyhow::Result<Self> {
        let upload = url::Url::parse(upload).with_context(|| format!("MediaServerUpload 无效: {}", upload))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(HttpMediaServer {
            client,
            upload: upload.as_str().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl MediaStore for HttpMediaServer {
    async fn put(&self, sha: &str, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let url = format!("{}/{}/{}", self.upload, sha, name);
        let mime = mime_guess::from_path(name)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM);
        tracing::debug!("上传文件到媒体服务器: {}", url);
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, mime.as_ref())
            .body(data.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// 写入本地目录, 由外部 web 服务提供下载
pub struct LocalMediaPath {
    dir: PathBuf,
}

impl LocalMediaPath {
    pub fn new(dir: &str) -> Self {
        LocalMediaPath { dir: PathBuf::from(dir) }
    }
}

#[async_trait]
impl MediaStore for LocalMediaPath {
    async fn put(&self, sha: &str, name: &str, data: &[u8]) -> anyhow::Result<()> {
        let dir = self.dir.join(sha);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("无法创建目录 {}", dir.display()))?;
        let path = dir.join(name);
        tracing::debug!("保存文件到本地: {}", path.display());
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("无法写入文件 {}", path.display()))?;
        Ok(())
    }
}

/// 媒体上传: 存储位置 + 对外下载地址
#[derive(Clone)]
pub struct Media {
    store: Arc<dyn MediaStore>,
    download: String,
}

impl Media {
    pub fn new(store: Arc<dyn MediaStore>, download: &str) -> Self {
        Media {
            store,
            download: download.trim_end_matches('/').to_string(),
        }
    }

    /// 没有配置媒体服务器时返回 None
    pub fn from_config(general: &GeneralConfig) -> anyhow::Result<Option<Self>> {
        let store: Arc<dyn MediaStore> = if !general.media_server_upload.is_empty() {
            Arc::new(HttpMediaServer::new(&general.media_server_upload)?)
        } else if !general.media_download_path.is_empty() {
            Arc::new(LocalMediaPath::new(&general.media_download_path))
        } else {
            return Ok(None);
        };
        Ok(Some(Media::new(store, &general.media_server_download)))
    }

    /// # 上传一个附件
    /// 成功后填充 `sha` 和 `url`; 已经上传过或没有数据的附件直接跳过。
    pub async fn upload(&self, file: &mut FileInfo) -> anyhow::Result<()> {
        if !file.sha.is_empty() && !file.url.is_empty() {
            return Ok(());
        }
        let data = match &file.data {
            Some(data) => data.clone(),
            None => return Ok(()),
        };
        let sha = short_sha(&data);
        let name = sanitize_name(&file.name);
        self.store.put(&sha, &name, &data).await?;
        file.url = format!("{}/{}/{}", self.download, sha, name);
        file.sha = sha;
        file.name = name;
        Ok(())
    }
}

/// sha1 的前 8 位, 作为文件目录名
pub fn short_sha(data: &[u8]) -> String {
    let mut hex = format!("{:x}", Sha1::digest(data));
    hex.truncate(8);
    hex
}

/// 文件名中除字母数字以外的连续字符替换为 `_`, 保留扩展名
pub fn sanitize_name(name: &str) -> String {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) => {
            (stem, Some(ext))
        }
        _ => (name, None),
    };
    let mut sanitized = String::with_capacity(name.len());
    let mut replaced = false;
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
            replaced = false;
        } else if !replaced {
            sanitized.push('_');
            replaced = true;
        }
    }
    if let Some(ext) = ext {
        sanitized.push('.');
        sanitized.push_str(ext);
    }
    sanitized
}
