
// 前端资源提供者：从磁盘目录读取 UI 文件。
pub mod provider_disk;

pub use provider_disk::DiskFrontend;
