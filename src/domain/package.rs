//! 部署包模型

use std::path::PathBuf;

use serde::Serialize;

/// 打包好的部署归档
///
/// 构建一次、传输一次，随后在本地与远端被删除
#[derive(Clone, Debug, Serialize)]
pub struct Package {
    /// 源路径（文件或目录），按加入顺序
    pub sources: Vec<PathBuf>,
    /// 排除子串
    pub excludes: Vec<String>,
    /// 无条件加入的额外文件
    pub extra_files: Vec<PathBuf>,
    /// 输出归档路径
    pub archive_path: PathBuf,
    pub size_bytes: u64,
    /// 归档内成员路径
    pub members: Vec<String>,
    /// 归档的 SHA-256（十六进制）
    pub sha256: String,
}

impl Package {
    /// 归档文件名
    pub fn file_name(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "deploy_package.tar.gz".to_string())
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0 / 1024.0
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }
}
