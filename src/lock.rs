//! 클러스터 락
//!
//! 소스 클러스터 하나에 복제 프로세스가 하나만 돌도록 `GET_LOCK`을 잡습니다.
//! 락은 연결에 묶여 있으므로 프로세스가 끝날 때까지 이 연결을 유지합니다.

use crate::config::ConnectionConfig;
use crate::connection::MySqlConnection;
use crate::error::{CdcError, Result};
use mysql_async::prelude::*;
use tracing::info;

pub struct MySqlClusterLock {
    conn: MySqlConnection,
    name: String,
}

impl MySqlClusterLock {
    /// 기다리지 않고 락을 시도한다. 다른 인스턴스가 잡고 있으면 `LockNotAcquired`
    pub async fn acquire(config: &ConnectionConfig, cluster: &str) -> Result<Self> {
        let mut conn = MySqlConnection::connect(config).await?;
        let name = lock_name(cluster);

        let result: Option<(Option<i64>,)> = conn
            .conn_mut()
            .exec_first("SELECT GET_LOCK(?, 0)", (name.as_str(),))
            .await?;
        check_acquired(&name, result)?;

        info!("Acquired cluster lock {}", name);
        Ok(MySqlClusterLock { conn, name })
    }

    pub async fn release(mut self) -> Result<()> {
        self.conn
            .conn_mut()
            .exec_drop("SELECT RELEASE_LOCK(?)", (self.name.as_str(),))
            .await?;
        info!("Released cluster lock {}", self.name);
        self.conn.close().await
    }
}

pub fn lock_name(cluster: &str) -> String {
    // GET_LOCK 이름은 64자 제한
    let name = format!("mysql_cdc.{}", cluster);
    name.chars().take(64).collect()
}

/// `GET_LOCK`은 성공 1, 타임아웃 0, 에러 NULL
fn check_acquired(name: &str, result: Option<(Option<i64>,)>) -> Result<()> {
    match result {
        Some((Some(1),)) => Ok(()),
        _ => Err(CdcError::LockNotAcquired(name.to_string())),
    }
}
