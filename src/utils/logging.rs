use tracing_subscriber::{fmt, EnvFilter};

/// 日志初始化
pub struct LoggingConfig;

impl LoggingConfig {
    /// 装一个 fmt 订阅器：RUST_LOG 优先，否则只放行本 crate 的
    /// info 及以上。重复调用是空操作，测试用例可以各自调一次。
    pub fn init() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("triggerflow=info"));
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        LoggingConfig::init();
        LoggingConfig::init();
    }
}
