//! 顺序ID生成器
//!
//! 在前缀后追加 "/" 和十六进制计数，例如 `prefix/1`、`prefix/2` … `prefix/a`。
//! 计数从 1 开始，整个进程生命周期内单调递增，不做溢出检查。
//!
//! 单写者：`next` 需要 `&mut self`，需要跨线程共享时由调用方自行加锁，
//! 或者每个连接/线程各持有一个实例。

#[derive(Debug, Clone)]
pub struct IdFactory {
    prefix: String,
    count: u64,
}

impl IdFactory {
    /// 创建以 `prefix` 为前缀的ID生成器
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            count: 0,
        }
    }

    /// 生成下一个ID
    pub fn next(&mut self) -> String {
        self.count += 1;
        format!("{}/{:x}", self.prefix, self.count)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
    }

    /// 已生成的ID数量
    pub fn issued(&self) -> u64 {
        self.count
    }
}
