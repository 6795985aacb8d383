//! MySQL 프로토콜 패킷 처리
//!
//! 패킷: 3 bytes 길이 + 1 byte sequence id + 본문. 명령을 보낼 때마다
//! sequence id는 0부터 다시 시작합니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 한 패킷의 최대 본문 길이. 이 길이의 패킷 뒤에는 이어지는 패킷이 있다.
const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: TcpStream,
    sequence: u8,
}

impl PacketChannel {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CdcError::ConnectionError(format!("Timed out connecting to {}", addr)))?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel { stream, sequence: 0 })
    }

    /// 새 명령 시작 전에 호출
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (여러 패킷으로 나뉜 본문은 합친다)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();

        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| CdcError::ConnectionLost(format!("Failed to read packet header: {}", e)))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            // 패킷 본문 읽기
            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| CdcError::ConnectionLost(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        if data.len() >= MAX_PAYLOAD_LEN {
            return Err(CdcError::ProtocolError(format!(
                "Packet too large: {} bytes",
                data.len()
            )));
        }

        // 패킷 헤더 작성
        let mut packet = Vec::with_capacity(4 + data.len());
        WriteBytesExt::write_u24::<LittleEndian>(&mut packet, data.len() as u32)?;
        WriteBytesExt::write_u8(&mut packet, self.sequence)?;
        packet.extend_from_slice(data);

        // 전송
        self.stream
            .write_all(&packet)
            .await
            .map_err(|e| CdcError::ConnectionLost(format!("Failed to write packet: {}", e)))?;
        self.stream.flush().await?;
        self.sequence = self.sequence.wrapping_add(1);

        Ok(())
    }

    /// 명령 패킷 전송 (sequence 0)
    pub async fn write_command(&mut self, data: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(data).await
    }
}

/// Greeting 패킷 파싱
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if is_error_packet(data) {
            return Err(ErrorPacket::parse(data).into_error("Handshake rejected"));
        }

        let mut cursor = std::io::Cursor::new(data);

        // Protocol version (1 byte)
        let protocol_version = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read protocol version: {}", e)))?;

        // Server version (null-terminated string)
        let server_version = read_null_terminated_string(&mut cursor)?;

        // Thread ID (4 bytes)
        let thread_id = ReadBytesExt::read_u32::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read thread ID: {}", e)))?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble_part1 = vec![0u8; 8];
        Read::read_exact(&mut cursor, &mut scramble_part1)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 1: {}", e)))?;

        // Filler (1 byte, always 0x00)
        ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read filler: {}", e)))?;

        // Capability flags (lower 2 bytes)
        let capabilities_lower = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities: {}", e)))?;

        // Character set (1 byte)
        let server_collation = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read collation: {}", e)))?;

        // Status flags (2 bytes)
        let server_status = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read status: {}", e)))?;

        // Capability flags (upper 2 bytes)
        let capabilities_upper = ReadBytesExt::read_u16::<LittleEndian>(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read capabilities upper: {}", e)))?;

        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        // Length of auth plugin data (1 byte)
        let auth_data_len = ReadBytesExt::read_u8(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read auth data length: {}", e)))?;

        // Reserved (10 bytes)
        let mut reserved = vec![0u8; 10];
        Read::read_exact(&mut cursor, &mut reserved)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read reserved: {}", e)))?;

        // Auth plugin data part 2 (at least 13 bytes, NUL 포함)
        let scramble_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut scramble_part2 = vec![0u8; scramble_len];
        Read::read_exact(&mut cursor, &mut scramble_part2)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read scramble part 2: {}", e)))?;

        let mut scramble = scramble_part1;
        scramble.extend_from_slice(&scramble_part2[..scramble_part2.len() - 1]); // 마지막 null byte 제외

        // 일부 서버는 플러그인 이름 끝에 NUL을 붙이지 않는다
        let rest = &data[cursor.position() as usize..];
        let auth_plugin_name = String::from_utf8_lossy(rest)
            .trim_end_matches('\0')
            .to_string();

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name,
        })
    }
}

/// ERR 패킷 (0xFF, code, '#', sql state, message)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: u16,
    pub message: String,
}

impl ErrorPacket {
    pub fn parse(data: &[u8]) -> Self {
        let code = match data {
            [_, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
            _ => 0,
        };
        // sql state marker가 있으면 6 bytes를 건너뛴다
        let message_start = if data.get(3) == Some(&b'#') { 9 } else { 3 };
        let message = data
            .get(message_start..)
            .map(|m| String::from_utf8_lossy(m).to_string())
            .unwrap_or_default();

        ErrorPacket { code, message }
    }

    pub fn into_error(self, context: &str) -> CdcError {
        CdcError::ProtocolError(format!("{}: {} - {}", context, self.code, self.message))
    }
}

/// OK 패킷이 아니면 에러로 변환
pub fn expect_ok(packet: &[u8], context: &str) -> Result<()> {
    if is_error_packet(packet) {
        return Err(ErrorPacket::parse(packet).into_error(context));
    }
    if !is_ok_packet(packet) {
        return Err(CdcError::ProtocolError(format!(
            "{}: unexpected response 0x{:02x}",
            context,
            packet.first().copied().unwrap_or_default()
        )));
    }
    Ok(())
}

/// null로 끝나는 문자열 읽기
fn read_null_terminated_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let byte = ReadBytesExt::read_u8(reader)
            .map_err(|e| CdcError::ProtocolError(format!("Failed to read string byte: {}", e)))?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8(bytes)
        .map_err(|e| CdcError::ProtocolError(format!("Invalid UTF-8 in string: {}", e)))
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFF
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0x00
}

/// EOF 패킷 확인 (0xFE, 9 bytes 미만)
pub fn is_eof_packet(data: &[u8]) -> bool {
    !data.is_empty() && data[0] == 0xFE && data.len() < 9
}
