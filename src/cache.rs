//! 母库嵌入的磁盘缓存
//!
//! 缓存文件名由母库文件身份（路径、修改时间、大小）、镜像开关和骨干网络标识共同决定，
//! 任何一项变化都会得到新的文件名。读取时再校验内容哈希和源文件列表，
//! 不一致或文件损坏时丢弃缓存重新计算。

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Result;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::MatchError;

/// 文件身份：路径、修改时间（纳秒）和大小
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub path: String,
    pub modified: u128,
    pub size: u64,
}

impl FileIdentity {
    /// 读取文件元数据，失败时修改时间和大小记为 0
    pub fn of<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let (modified, size) = std::fs::metadata(path)
            .map(|meta| {
                let modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                (modified, meta.len())
            })
            .unwrap_or((0, 0));
        Self { path: path.to_string_lossy().into_owned(), modified, size }
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    meta: &'a [FileIdentity],
    mirror: bool,
    backbone: &'a str,
}

/// 计算缓存键
pub fn cache_key(sources: &[FileIdentity], mirror: bool, backbone: &str) -> String {
    let material = KeyMaterial { meta: sources, mirror, backbone };
    // 序列化到内存不会失败
    let bytes = bincode::serialize(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex()[..32].to_string()
}

/// 缓存的嵌入矩阵
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmbeddings {
    pub dim: usize,
    pub orientations: usize,
    /// 按行展开的 (行数, dim) 矩阵
    pub vectors: Vec<f32>,
    /// 每一行所属的候选图标序号
    pub owner: Vec<u32>,
    /// 构建时的母库源文件列表，顺序与候选序号一致
    pub sources: Vec<String>,
    checksum: [u8; 32],
}

impl CachedEmbeddings {
    pub fn new(
        dim: usize,
        orientations: usize,
        vectors: Vec<f32>,
        owner: Vec<u32>,
        sources: Vec<String>,
    ) -> Self {
        let checksum = content_hash(&vectors, &owner);
        Self { dim, orientations, vectors, owner, sources, checksum }
    }

    pub fn rows(&self) -> usize {
        self.owner.len()
    }

    fn verify(&self, sources: &[String]) -> Result<(), MatchError> {
        if content_hash(&self.vectors, &self.owner) != self.checksum {
            return Err(MatchError::CacheMismatch("内容校验失败".to_string()));
        }
        if self.vectors.len() != self.owner.len() * self.dim {
            return Err(MatchError::CacheMismatch("矩阵尺寸错误".to_string()));
        }
        if self.sources != sources {
            return Err(MatchError::CacheMismatch(format!(
                "源文件列表不同（缓存 {} 个，当前 {} 个）",
                self.sources.len(),
                sources.len()
            )));
        }
        if self.owner.iter().any(|&o| o as usize >= sources.len()) {
            return Err(MatchError::CacheMismatch("行所属序号越界".to_string()));
        }
        Ok(())
    }
}

fn content_hash(vectors: &[f32], owner: &[u32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bytemuck::cast_slice(vectors));
    hasher.update(bytemuck::cast_slice(owner));
    *hasher.finalize().as_bytes()
}

/// 嵌入缓存目录的句柄
#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
    tag: String,
}

impl EmbeddingCache {
    /// `tag` 用于区分不同母库/分类的缓存文件，便于人工清理
    pub fn new<P: AsRef<Path>>(dir: P, tag: &str) -> Self {
        let tag = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self { dir: dir.as_ref().to_path_buf(), tag }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        if self.tag.is_empty() {
            self.dir.join(format!("embeddings_{key}.bin"))
        } else {
            self.dir.join(format!("embeddings_{key}_{}.bin", self.tag))
        }
    }

    /// 读取并校验缓存；文件不存在返回 None，损坏或不一致时记录警告后返回 None
    pub fn load(&self, key: &str, sources: &[String]) -> Option<CachedEmbeddings> {
        let path = self.path_for(key);
        if !path.exists() {
            debug!("嵌入缓存不存在: {}", path.display());
            return None;
        }
        let cached = File::open(&path)
            .map_err(MatchError::from)
            .and_then(|f| {
                bincode::deserialize_from::<_, CachedEmbeddings>(BufReader::new(f))
                    .map_err(|e| MatchError::CacheMismatch(e.to_string()))
            })
            .and_then(|cached| cached.verify(sources).map(|_| cached));
        match cached {
            Ok(cached) => {
                debug!("命中嵌入缓存: {}", path.display());
                Some(cached)
            }
            Err(e) => {
                warn!("丢弃嵌入缓存 {}: {e}", path.display());
                None
            }
        }
    }

    /// 写入缓存，先写临时文件再重命名
    pub fn store(&self, key: &str, embeddings: &CachedEmbeddings) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, embeddings)?;
            std::io::Write::flush(&mut writer)?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!("写入嵌入缓存: {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CachedEmbeddings {
        CachedEmbeddings::new(
            2,
            4,
            vec![1., 0., 0., 1., 0.6, 0.8],
            vec![0, 0, 1],
            vec!["a.png".to_string(), "b.png".to_string()],
        )
    }

    fn sources() -> Vec<String> {
        vec!["a.png".to_string(), "b.png".to_string()]
    }

    #[test]
    fn store_then_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = EmbeddingCache::new(dir.path(), "M1/INSTANCES");
        let path = cache.store("abc", &sample())?;
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("M1_INSTANCES.bin"));
        assert_eq!(cache.load("abc", &sources()), Some(sample()));
        Ok(())
    }

    #[test]
    fn missing_and_mismatched_sources_are_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = EmbeddingCache::new(dir.path(), "");
        assert!(cache.load("abc", &sources()).is_none());
        cache.store("abc", &sample())?;
        assert!(cache.load("abc", &["b.png".to_string(), "a.png".to_string()]).is_none());
        Ok(())
    }

    #[test]
    fn truncated_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = EmbeddingCache::new(dir.path(), "");
        let path = cache.store("abc", &sample())?;
        let bytes = std::fs::read(&path)?;
        std::fs::write(&path, &bytes[..bytes.len() / 2])?;
        assert!(cache.load("abc", &sources()).is_none());
        Ok(())
    }

    #[test]
    fn tampered_vectors_fail_checksum() {
        let mut cached = sample();
        cached.vectors[0] = 0.5;
        assert!(matches!(cached.verify(&sources()), Err(MatchError::CacheMismatch(_))));
    }

    #[test]
    fn key_depends_on_every_input() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("a.png");
        std::fs::write(&file, b"abc")?;
        let ids = vec![FileIdentity::of(&file)];
        assert_eq!(ids[0].size, 3);

        let base = cache_key(&ids, false, "net");
        assert_eq!(base, cache_key(&ids, false, "net"));
        assert_ne!(base, cache_key(&ids, true, "net"));
        assert_ne!(base, cache_key(&ids, false, "other"));

        std::fs::write(&file, b"abcd")?;
        assert_ne!(base, cache_key(&[FileIdentity::of(&file)], false, "net"));
        Ok(())
    }

    #[test]
    fn identity_of_missing_file() {
        let id = FileIdentity::of("/nonexistent/a.png");
        assert_eq!((id.modified, id.size), (0, 0));
    }
}
