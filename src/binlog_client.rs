//! MySQL Binlog 클라이언트
//!
//! 복제 클라이언트로 접속해 binlog 이벤트를 읽습니다.
//!
//! 1. TCP 연결, 핸드셰이크, 인증
//! 2. `SET @master_binlog_checksum='NONE'`
//! 3. COM_REGISTER_SLAVE
//! 4. COM_BINLOG_DUMP (파일/위치) 또는 COM_BINLOG_DUMP_GTID
//! 5. 이벤트 스트리밍. 테이블 맵, rotate, XID 등은 내부에서 소비하고
//!    트랜잭션 마커, 쿼리, row 배치만 `SourceEvent`로 내보낸다.

use crate::auth::{self, AuthSwitchRequest};
use crate::binlog::BinlogParser;
use crate::config::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::{BinlogEventData, EventHeader, EventType, SourceEvent, TableMapData};
use crate::gtid::GtidSet;
use crate::position::{LogCursor, ResumeParameters, BINLOG_START_POS};
use crate::protocol::{self, ErrorPacket, GreetingPacket, PacketChannel};
use crate::source::ReplicationSource;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use tracing::{debug, info, trace};

/// COM_QUERY 명령어 코드
const COM_QUERY: u8 = 0x03;

/// COM_BINLOG_DUMP 명령어 코드
const COM_BINLOG_DUMP: u8 = 0x12;

/// COM_REGISTER_SLAVE 명령어 코드
const COM_REGISTER_SLAVE: u8 = 0x15;

/// COM_BINLOG_DUMP_GTID 명령어 코드
const COM_BINLOG_DUMP_GTID: u8 = 0x1e;

/// 로그 끝에서 기다리지 않고 EOF를 보내도록 요청
const BINLOG_DUMP_NON_BLOCK: u16 = 0x01;

/// GTID 집합으로 시작 위치를 지정
const BINLOG_THROUGH_GTID: u16 = 0x04;

/// utf8mb4_general_ci
const UTF8MB4_COLLATION: u8 = 45;

/// Binlog 클라이언트
pub struct BinlogClient {
    channel: PacketChannel,
    server_id: u32,
    /// 다음 이벤트의 시작 위치
    cursor: LogCursor,
    table_maps: HashMap<u64, TableMapData>,
    /// 연속된 테이블 맵 묶음의 첫 이벤트 위치 (row 배치의 재시작 기준점)
    batch_start: Option<LogCursor>,
    previous_was_table_map: bool,
}

impl BinlogClient {
    /// 인증까지 마친 연결
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        info!("Connecting to {}:{}", config.hostname, config.port);

        // 1. TCP 소켓 열기
        let mut channel = PacketChannel::connect(&config.hostname, config.port, config.timeout).await?;

        // 2. MySQL 핸드셰이크 수신
        let greeting_packet = channel.read_packet().await?;
        let greeting = GreetingPacket::parse(&greeting_packet)?;

        info!(
            "MySQL Server version: {}, Thread ID: {}, auth plugin: {}",
            greeting.server_version, greeting.thread_id, greeting.auth_plugin_name
        );

        // 3. 인증
        let auth_response = auth::create_handshake_response(
            &config.username,
            &config.password,
            None,
            &greeting.scramble,
            UTF8MB4_COLLATION,
            &greeting.auth_plugin_name,
        )?;
        channel.write_packet(&auth_response).await?;

        Self::finish_authentication(&mut channel, &config.password).await?;
        info!("Authentication successful");

        let mut client = BinlogClient {
            channel,
            server_id: config.server_id,
            cursor: LogCursor::new(String::new(), BINLOG_START_POS),
            table_maps: HashMap::new(),
            batch_start: None,
            previous_was_table_map: false,
        };

        // 4. 체크섬 설정
        // 이벤트 파서는 CRC32 꼬리가 없다고 가정한다
        client
            .simple_query("SET @master_binlog_checksum='NONE'")
            .await?;
        debug!("Binlog checksum set to NONE");

        Ok(client)
    }

    /// 연결, 등록, dump 요청까지 한 번에
    pub async fn open(
        config: &ConnectionConfig,
        params: &ResumeParameters,
        blocking: bool,
    ) -> Result<Self> {
        let mut client = Self::connect(config).await?;
        client.register_slave().await?;
        client.request_dump(params, blocking).await?;
        Ok(client)
    }

    /// 인증 결과 확인 (auth switch, caching_sha2 fast path 포함)
    async fn finish_authentication(channel: &mut PacketChannel, password: &str) -> Result<()> {
        loop {
            let packet = channel.read_packet().await?;
            match packet.first() {
                Some(0x00) => return Ok(()),
                Some(0xFF) => {
                    return Err(CdcError::ConnectionError(format!(
                        "Authentication failed: {}",
                        ErrorPacket::parse(&packet).message
                    )))
                }
                Some(0xFE) => {
                    let request = AuthSwitchRequest::parse(&packet)?;
                    debug!("Auth switch to plugin: {}", request.plugin);
                    let response = auth::scramble_for_plugin(&request.plugin, password, &request.scramble)?;
                    channel.write_packet(&response).await?;
                }
                Some(0x01) => match packet.get(1) {
                    // 서버 캐시에 있으면 OK 패킷이 이어서 온다
                    Some(&auth::FAST_AUTH_SUCCESS) => debug!("caching_sha2 fast auth success"),
                    Some(&auth::PERFORM_FULL_AUTHENTICATION) => {
                        return Err(CdcError::ConnectionError(
                            "caching_sha2_password full authentication requires a secure connection; \
                             log in once with a TLS client to populate the server cache"
                                .to_string(),
                        ))
                    }
                    other => {
                        return Err(CdcError::ProtocolError(format!(
                            "Unexpected auth more-data packet: {:?}",
                            other
                        )))
                    }
                },
                other => {
                    return Err(CdcError::ProtocolError(format!(
                        "Unexpected auth response: {:?}",
                        other
                    )))
                }
            }
        }
    }

    /// 결과셋이 없는 쿼리 실행
    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());

        self.channel.write_command(&packet).await?;
        let response = self.channel.read_packet().await?;
        protocol::expect_ok(&response, sql)
    }

    /// 복제 클라이언트로 등록
    pub async fn register_slave(&mut self) -> Result<()> {
        self.channel
            .write_command(&Self::create_register_slave_command(self.server_id))
            .await?;
        let response = self.channel.read_packet().await?;
        protocol::expect_ok(&response, "COM_REGISTER_SLAVE")?;

        info!("Registered as replica with server_id={}", self.server_id);
        Ok(())
    }

    /// dump 요청
    pub async fn request_dump(&mut self, params: &ResumeParameters, blocking: bool) -> Result<()> {
        let flags = if blocking { 0 } else { BINLOG_DUMP_NON_BLOCK };

        let command = match params {
            ResumeParameters::File { log_file, log_pos } => {
                self.cursor = LogCursor::new(log_file.clone(), *log_pos);
                info!(
                    "Sent COM_BINLOG_DUMP: file={}, position={}, blocking={}",
                    log_file, log_pos, blocking
                );
                Self::create_binlog_dump_command(self.server_id, log_file, *log_pos, flags)?
            }
            ResumeParameters::Gtid { auto_position } => {
                let gtid_set = GtidSet::parse(auto_position)?;
                info!(
                    "Sent COM_BINLOG_DUMP_GTID: gtid_set={}, blocking={}",
                    auto_position, blocking
                );
                Self::create_binlog_dump_gtid_command(self.server_id, &gtid_set, flags)?
            }
        };

        self.channel.write_command(&command).await
    }

    /// COM_REGISTER_SLAVE 명령어 생성
    fn create_register_slave_command(server_id: u32) -> BytesMut {
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank (ignored)
        packet.put_u32_le(0); // master id
        packet
    }

    /// COM_BINLOG_DUMP 명령어 생성
    fn create_binlog_dump_command(
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u64,
        flags: u16,
    ) -> Result<BytesMut> {
        let position = u32::try_from(binlog_position).map_err(|_| {
            CdcError::InvalidPosition(format!("Binlog position out of range: {}", binlog_position))
        })?;

        let mut packet = BytesMut::with_capacity(binlog_filename.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(position);
        packet.put_u16_le(flags);
        packet.put_u32_le(server_id);
        packet.put_slice(binlog_filename.as_bytes());

        debug!(
            "Created COM_BINLOG_DUMP command: server_id={}, file={}, position={}",
            server_id, binlog_filename, binlog_position
        );

        Ok(packet)
    }

    /// COM_BINLOG_DUMP_GTID 명령어 생성
    fn create_binlog_dump_gtid_command(server_id: u32, gtid_set: &GtidSet, flags: u16) -> Result<BytesMut> {
        let gtid_data = gtid_set.encode_request()?;

        let mut packet = BytesMut::with_capacity(23 + gtid_data.len());
        packet.put_u8(COM_BINLOG_DUMP_GTID);
        packet.put_u16_le(BINLOG_THROUGH_GTID | flags);
        packet.put_u32_le(server_id);
        packet.put_u32_le(0); // binlog filename length (empty for GTID)
        packet.put_u64_le(BINLOG_START_POS);
        packet.put_u32_le(gtid_data.len() as u32);
        packet.put_slice(&gtid_data);

        Ok(packet)
    }

    /// 헤더로 커서를 옮기고 이벤트 시작 위치를 돌려준다
    ///
    /// `next_pos`가 0인 이벤트는 서버가 만든 가짜 이벤트라 위치가 없다.
    fn advance(&mut self, header: &EventHeader) -> LogCursor {
        if header.next_pos == 0 {
            return self.cursor.clone();
        }
        let next = header.next_pos as u64;
        let start = next.saturating_sub(header.event_length as u64);
        self.cursor.pos = next;
        LogCursor::new(self.cursor.file.clone(), start)
    }

    /// 이벤트 하나를 파싱해서 외부로 내보낼 이벤트면 돌려준다
    fn handle_event(&mut self, data: &[u8]) -> Result<Option<SourceEvent>> {
        let (header, offset) = BinlogParser::parse_header(data)?;
        let body = &data[offset..];
        let start = self.advance(&header);

        trace!(
            "Event: type={:?}, size={}, next_pos={}",
            header.event_type,
            header.event_length,
            header.next_pos
        );

        let was_table_map = std::mem::replace(&mut self.previous_was_table_map, false);

        let parsed = match header.event_type {
            EventType::RotateEvent => {
                BinlogEventData::Rotate(BinlogParser::parse_rotate_event(body)?)
            }
            EventType::TableMapEvent => {
                BinlogEventData::TableMap(BinlogParser::parse_table_map_event(body)?)
            }
            EventType::GtidEvent => BinlogEventData::Gtid(BinlogParser::parse_gtid_event(body)?),
            EventType::QueryEvent => BinlogEventData::Query(BinlogParser::parse_query_event(body)?),
            EventType::XidEvent => BinlogEventData::Xid(BinlogParser::parse_xid_event(body)?),
            event_type if event_type.row_kind().is_some() => {
                let table_id = BinlogParser::peek_table_id(body)?;
                let table_map = self.table_maps.get(&table_id).ok_or_else(|| {
                    CdcError::InvalidEvent(format!(
                        "Rows event for unknown table id {} at {}",
                        table_id, start
                    ))
                })?;
                BinlogEventData::Rows(BinlogParser::parse_rows_event(body, event_type, table_map)?)
            }
            _ => BinlogEventData::Ignored,
        };

        let event = match parsed {
            BinlogEventData::Rotate(rotate) => {
                debug!("Rotate to {}:{}", rotate.next_binlog_name, rotate.position);
                self.cursor = LogCursor::new(rotate.next_binlog_name, rotate.position);
                None
            }
            BinlogEventData::TableMap(table_map) => {
                if !was_table_map {
                    self.batch_start = Some(start);
                }
                self.previous_was_table_map = true;
                self.table_maps.insert(table_map.table_id, table_map);
                None
            }
            BinlogEventData::Gtid(gtid) => Some(SourceEvent::Gtid {
                gtid: gtid.gtid,
                cursor: start,
            }),
            BinlogEventData::Query(query) => Some(SourceEvent::Query {
                database: query.database,
                statement: query.query,
                timestamp: header.timestamp,
                start,
                end: self.cursor.clone(),
            }),
            BinlogEventData::Rows(rows) => {
                let (database, table) = self
                    .table_maps
                    .get(&rows.table_id)
                    .map(|m| (m.database.clone(), m.table.clone()))
                    .unwrap_or_default();
                Some(SourceEvent::Rows {
                    database,
                    table,
                    kind: rows.kind,
                    rows: rows.rows,
                    timestamp: header.timestamp,
                    batch_start: self.batch_start.clone().unwrap_or(start),
                    end: self.cursor.clone(),
                })
            }
            BinlogEventData::Xid(_) | BinlogEventData::Ignored => None,
        };

        Ok(event)
    }
}

#[async_trait]
impl ReplicationSource for BinlogClient {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        loop {
            let packet = self.channel.read_packet().await?;

            // 에러 패킷 확인
            if protocol::is_error_packet(&packet) {
                return Err(ErrorPacket::parse(&packet).into_error("Binlog stream error"));
            }

            // EOF 패킷: non-blocking dump가 로그 끝에 닿았다
            if protocol::is_eof_packet(&packet) {
                debug!("Received EOF packet at {}", self.cursor);
                return Ok(None);
            }

            // 첫 바이트 0x00은 OK 표시, 실제 이벤트 데이터는 그 다음부터
            let event_data = match packet.split_first() {
                Some((0x00, rest)) => rest,
                _ => {
                    return Err(CdcError::ProtocolError(format!(
                        "Unexpected packet in binlog stream: {:02x?}",
                        &packet[..packet.len().min(16)]
                    )))
                }
            };

            if let Some(event) = self.handle_event(event_data)? {
                return Ok(Some(event));
            }
        }
    }

    fn cursor(&self) -> LogCursor {
        self.cursor.clone()
    }
}
