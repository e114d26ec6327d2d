//! 部署归档打包
//!
//! 把构建产物打成 tar.gz。排除规则是对成员归档内相对路径的子串匹配，逐个成员判断，
//! 因此 `server/uploads` 这样的嵌套子树会被单独剪掉

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::package::Package;
use crate::error::{DeployError, DeployResult};

/// 打包请求
#[derive(Clone, Debug)]
pub struct PackageSpec {
    /// 源路径与归档内路径都以此目录为基准
    pub base_dir: PathBuf,
    pub sources: Vec<PathBuf>,
    pub excludes: Vec<String>,
    /// 无条件加入，不受排除规则影响
    pub extra_files: Vec<PathBuf>,
    pub output: PathBuf,
}

pub struct Packager;

impl Packager {
    /// 在阻塞线程池中打包
    pub async fn build(spec: PackageSpec) -> DeployResult<Package> {
        tokio::task::spawn_blocking(move || Self::build_blocking(&spec))
            .await
            .map_err(|e| DeployError::packaging(format!("packaging task failed: {}", e)))?
    }

    pub fn build_blocking(spec: &PackageSpec) -> DeployResult<Package> {
        for source in spec.sources.iter().chain(spec.extra_files.iter()) {
            let full = spec.base_dir.join(source);
            if !full.exists() {
                return Err(DeployError::packaging(format!(
                    "source {} does not exist",
                    full.display()
                )));
            }
        }

        if let Some(parent) = spec.output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error("create output dir", parent, e))?;
            }
        }

        let file = File::create(&spec.output).map_err(|e| io_error("create", &spec.output, e))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut members = Vec::new();

        for source in &spec.sources {
            info!(source = %source.display(), "Adding to package");
            let full = spec.base_dir.join(source);
            if full.is_file() {
                let name = archive_name(source);
                builder
                    .append_path_with_name(&full, &name)
                    .map_err(|e| io_error("append", &full, e))?;
                members.push(name);
                continue;
            }

            let walker = WalkDir::new(&full)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    let rel = entry.path().strip_prefix(&spec.base_dir).unwrap_or(entry.path());
                    !is_excluded(&archive_name(rel), &spec.excludes)
                });

            for entry in walker {
                let entry =
                    entry.map_err(|e| DeployError::packaging(format!("walk {}: {}", full.display(), e)))?;
                let rel = entry
                    .path()
                    .strip_prefix(&spec.base_dir)
                    .map_err(|e| DeployError::packaging(e.to_string()))?;
                let name = archive_name(rel);
                if name.is_empty() {
                    continue;
                }

                let file_type = entry.file_type();
                if file_type.is_dir() {
                    builder
                        .append_dir(&name, entry.path())
                        .map_err(|e| io_error("append dir", entry.path(), e))?;
                } else if file_type.is_file() || file_type.is_symlink() {
                    builder
                        .append_path_with_name(entry.path(), &name)
                        .map_err(|e| io_error("append", entry.path(), e))?;
                    members.push(name);
                } else {
                    debug!(path = %entry.path().display(), "Skipping special file");
                }
            }
        }

        for extra in &spec.extra_files {
            let name = archive_name(extra);
            if members.contains(&name) {
                continue;
            }
            let full = spec.base_dir.join(extra);
            info!(file = %extra.display(), "Adding to package");
            builder
                .append_path_with_name(&full, &name)
                .map_err(|e| io_error("append", &full, e))?;
            members.push(name);
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| io_error("finish tar", &spec.output, e))?;
        let writer = encoder
            .finish()
            .map_err(|e| io_error("finish gzip", &spec.output, e))?;
        writer
            .into_inner()
            .map_err(|e| io_error("flush", &spec.output, e.into_error()))?
            .sync_all()
            .map_err(|e| io_error("sync", &spec.output, e))?;

        let size_bytes = fs::metadata(&spec.output)
            .map_err(|e| io_error("stat", &spec.output, e))?
            .len();
        let sha256 = sha256_file(&spec.output).map_err(|e| io_error("hash", &spec.output, e))?;

        info!(
            archive = %spec.output.display(),
            members = members.len(),
            size_bytes,
            "Package created"
        );

        Ok(Package {
            sources: spec.sources.clone(),
            excludes: spec.excludes.clone(),
            extra_files: spec.extra_files.clone(),
            archive_path: spec.output.clone(),
            size_bytes,
            members,
            sha256,
        })
    }

    /// 删除本地归档，文件不存在不算错误
    pub fn remove(package: &Package) -> io::Result<()> {
        match fs::remove_file(&package.archive_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn is_excluded(name: &str, excludes: &[String]) -> bool {
    excludes
        .iter()
        .any(|exc| !exc.is_empty() && name.contains(exc.as_str()))
}

/// 归档内相对路径：正斜杠分隔，无 `./` 前缀
fn archive_name(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    raw.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn io_error(action: &str, path: &Path, e: io::Error) -> DeployError {
    DeployError::packaging(format!("{} {}: {}", action, path.display(), e))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
