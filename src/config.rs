//! 복제 프로세스 설정
//!
//! 설정은 시작 시 한 번 만들어지고 `Arc<ReplicationConfig>`로 각 컴포넌트에
//! 전달됩니다. 컴포넌트 내부에서 환경 변수나 전역 상태를 읽지 않습니다.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// MySQL 연결 설정
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 클라이언트로 등록할 때 쓰는 server id (소스 연결에서만 의미가 있음)
    pub server_id: u32,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("server_id", &self.server_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// mysql_async 연결 옵션 생성
    pub fn build_opts(&self) -> mysql_async::Opts {
        let builder = mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone());
        mysql_async::Opts::from(builder)
    }

    /// `{PREFIX}_HOST` 형식의 환경 변수로 값을 덮어쓴다
    fn apply_env(&mut self, prefix: &str) {
        if let Ok(host) = env::var(format!("{}_HOST", prefix)) {
            self.hostname = host;
        }
        if let Some(port) = env::var(format!("{}_PORT", prefix))
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = port;
        }
        if let Ok(user) = env::var(format!("{}_USER", prefix)) {
            self.username = user;
        }
        if let Ok(password) = env::var(format!("{}_PASSWORD", prefix)) {
            self.password = password;
        }
        if let Ok(name) = env::var(format!("{}_NAME", prefix)) {
            self.database = Some(name);
        }
    }
}

/// 고정 간격 재시도 정책
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// 전체 복제 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// 소스 클러스터 이름. 상태 레코드와 락의 키로 쓰인다.
    pub cluster_name: String,
    /// 복제 스트림을 읽을 소스 DB
    pub source: ConnectionConfig,
    /// 미러 스키마를 유지하는 트래커 DB
    pub tracker: ConnectionConfig,
    /// 체크포인트를 저장하는 상태 DB (없으면 메모리 저장소)
    pub state: Option<ConnectionConfig>,
    pub gtid_enabled: bool,
    /// 비정상 종료 후 재발행할 최대 이벤트 수
    pub recovery_queue_size: usize,
    /// 이 개수만큼 데이터 이벤트를 처리하면 체크포인트
    pub checkpoint_size: usize,
    #[serde(with = "duration_millis")]
    pub checkpoint_interval: Duration,
    /// 백그라운드 fetch 워커를 기다리는 최대 시간
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    pub heartbeat_database: String,
    pub heartbeat_table: String,
    pub ddl_retry: RetryPolicy,
    pub publish_dry_run: bool,
    pub topic_namespace: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            cluster_name: "primary".to_string(),
            source: ConnectionConfig::default(),
            tracker: ConnectionConfig::default(),
            state: None,
            gtid_enabled: true,
            recovery_queue_size: 5000,
            checkpoint_size: 500,
            checkpoint_interval: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            heartbeat_database: "yelp_heartbeat".to_string(),
            heartbeat_table: "replication_heartbeat".to_string(),
            ddl_retry: RetryPolicy::default(),
            publish_dry_run: false,
            topic_namespace: "cdc".to_string(),
        }
    }
}

impl ReplicationConfig {
    /// TOML 파일에서 설정을 읽는다. 파일이 없으면 기본값을 쓴다.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(ReplicationConfig::default());
        }

        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CdcError::Config(e.to_string()))
    }

    /// 파일 설정 위에 환경 변수를 적용
    ///
    /// 소스: `DB_*`, 트래커: `TRACKER_*`, 상태 DB: `STATE_*`
    pub fn with_env_overrides(mut self) -> Self {
        self.source.apply_env("DB");
        self.tracker.apply_env("TRACKER");

        if env::var("STATE_HOST").is_ok() {
            let mut state = self.state.take().unwrap_or_default();
            state.apply_env("STATE");
            self.state = Some(state);
        } else if let Some(state) = self.state.as_mut() {
            state.apply_env("STATE");
        }

        if let Ok(cluster) = env::var("CDC_CLUSTER") {
            self.cluster_name = cluster;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(CdcError::Config("cluster_name must not be empty".to_string()));
        }
        if self.recovery_queue_size == 0 {
            return Err(CdcError::Config("recovery_queue_size must be positive".to_string()));
        }
        if self.checkpoint_size == 0 {
            return Err(CdcError::Config("checkpoint_size must be positive".to_string()));
        }
        if self.ddl_retry.max_attempts == 0 {
            return Err(CdcError::Config("ddl_retry.max_attempts must be positive".to_string()));
        }
        Ok(())
    }

    /// 하트비트 테이블 여부
    pub fn is_heartbeat_table(&self, database: &str, table: &str) -> bool {
        self.heartbeat_database == database && self.heartbeat_table == table
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_connection_config_debug_redacts_password() {
        let mut config = ConnectionConfig::new("127.0.0.1", "repl");
        config.password = "hunter2".to_string();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ReplicationConfig::from_toml(
            r#"
            cluster_name = "refresh_primary"
            gtid_enabled = false
            checkpoint_interval = 2500

            [source]
            hostname = "10.0.0.5"
            port = 3307
            timeout = 5

            [ddl_retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.cluster_name, "refresh_primary");
        assert!(!config.gtid_enabled);
        assert_eq!(config.checkpoint_interval, Duration::from_millis(2500));
        assert_eq!(config.source.hostname, "10.0.0.5");
        assert_eq!(config.source.timeout, Duration::from_secs(5));
        assert_eq!(config.source.username, "root");
        assert_eq!(config.ddl_retry.max_attempts, 5);
        assert_eq!(config.ddl_retry.delay, Duration::from_secs(1));
        assert_eq!(config.recovery_queue_size, 5000);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = ReplicationConfig::default();
        assert!(config.validate().is_ok());

        config.checkpoint_size = 0;
        assert!(matches!(config.validate(), Err(CdcError::Config(_))));

        config.checkpoint_size = 1;
        config.cluster_name = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ReplicationConfig::from_file("/nonexistent/cdc.toml").unwrap();
        assert_eq!(config.cluster_name, "primary");
    }
}
