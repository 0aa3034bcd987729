//! PostgreSQL driver built on `tokio-postgres`.
use std::error::Error as StdError;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{pin_mut, TryStreamExt};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, warn};

use crate::db::{Cell, DatabaseType, DbConnection, Driver, TabularResult};
use crate::error::{categorize_sqlstate, sql_excerpt, EngineError, ErrorCategory, Result};

/// TLS settings applied to every PostgreSQL connection that negotiates SSL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresTlsOptions {
    /// Accept invalid/self-signed certificates. Use with caution.
    pub accept_invalid_certs: bool,
    /// Optional path to a custom CA certificate bundle (PEM format).
    pub ca_cert_path: Option<PathBuf>,
}

pub struct PostgresDriver {
    tls: PostgresTlsOptions,
    connect_timeout: Duration,
}

impl PostgresDriver {
    pub fn new(tls: PostgresTlsOptions, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new(PostgresTlsOptions::default(), Duration::from_secs(15))
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSql
    }

    fn driver_name(&self) -> &'static str {
        "tokio-postgres"
    }

    async fn connect(&self, connection_string: &str) -> Result<Box<dyn DbConnection>> {
        let config: tokio_postgres::Config = connection_string.parse().map_err(|e| {
            EngineError::Configuration(format!("invalid PostgreSQL connection string: {}", e))
        })?;
        let timeout_msg = || {
            EngineError::Connection(format!(
                "connection timed out after {}s",
                self.connect_timeout.as_secs()
            ))
        };

        let (client, tls) = match config.get_ssl_mode() {
            SslMode::Disable => {
                let (client, connection) =
                    tokio::time::timeout(self.connect_timeout, config.connect(NoTls))
                        .await
                        .map_err(|_| timeout_msg())?
                        .map_err(|e| connect_error(&e))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres connection closed with error");
                    }
                });
                (client, None)
            }
            _ => {
                let tls = build_tls_connector(&self.tls)?;
                let (client, connection) =
                    tokio::time::timeout(self.connect_timeout, config.connect(tls.clone()))
                        .await
                        .map_err(|_| timeout_msg())?
                        .map_err(|e| connect_error(&e))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres connection closed with error");
                    }
                });
                (client, Some(tls))
            }
        };

        Ok(Box::new(PgConnection { client, tls }))
    }
}

struct PgConnection {
    client: Client,
    /// Connector for cancel requests, which open their own socket.
    tls: Option<MakeTlsConnector>,
}

#[async_trait]
impl DbConnection for PgConnection {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSql
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn query(&mut self, sql: &str) -> Result<TabularResult> {
        let sql = sql.trim();
        // Preparing first exposes the column list even when no rows come back.
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| pg_error(&e, sql))?;
        let headers = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let mut result = TabularResult::new(headers);

        let stream = self
            .client
            .query_raw(&statement, std::iter::empty::<&(dyn ToSql + Sync)>())
            .await
            .map_err(|e| pg_error(&e, sql))?;
        pin_mut!(stream);

        while let Some(row) = stream.try_next().await.map_err(|e| pg_error(&e, sql))? {
            let cells = row
                .columns()
                .iter()
                .enumerate()
                .map(|(idx, col)| extract_cell(&row, idx, col.type_()))
                .collect();
            result.push_row(cells)?;
        }

        if result.column_count() == 0 {
            result.set_rows_affected(stream.rows_affected());
        }
        Ok(result)
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| pg_error(&e, sql))
    }

    async fn cancel(&mut self) -> Result<()> {
        let token = self.client.cancel_token();
        let cancelled = match &self.tls {
            Some(tls) => token.cancel_query(tls.clone()).await,
            None => token.cancel_query(NoTls).await,
        };
        cancelled.map_err(|e| connect_error(&e))
    }
}

fn connect_error(err: &tokio_postgres::Error) -> EngineError {
    match err.source() {
        Some(source) => EngineError::Connection(format!("{}: {}", err, source)),
        None => EngineError::Connection(err.to_string()),
    }
}

/// Map a driver error to the engine taxonomy, keeping SQLSTATE, detail,
/// hint and the line/column of the failure when the server reports them.
fn pg_error(err: &tokio_postgres::Error, sql: &str) -> EngineError {
    let Some(db_err) = err.as_db_error() else {
        if err.is_closed() || err.source().is_some() {
            return connect_error(err);
        }
        return EngineError::execution(err.to_string(), sql);
    };

    let code = db_err.code().code().to_string();
    let category = categorize_sqlstate(&code);
    if category == ErrorCategory::Connection {
        return EngineError::Connection(db_err.message().to_string());
    }

    let mut message = db_err.message().to_string();
    if let Some(tokio_postgres::error::ErrorPosition::Original(pos)) = db_err.position() {
        let (line, col) = byte_offset_to_line_col(sql, *pos as usize);
        message.push_str(&format!(" (at line {}, column {})", line, col));
    }
    if let Some(detail) = db_err.detail() {
        message.push_str(&format!("; detail: {}", detail));
    }
    if let Some(hint) = db_err.hint() {
        message.push_str(&format!("; hint: {}", hint));
    }

    EngineError::Execution {
        message,
        sql: sql_excerpt(sql),
        category,
        code: Some(code),
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (usize, usize) {
    if byte_pos == 0 || query.is_empty() {
        return (1, 1);
    }
    let target = (byte_pos - 1).min(query.len());
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

type BoxError = Box<dyn StdError + Sync + Send>;

/// Any non-NULL PostgreSQL value rendered as text.
///
/// NULLs never reach `from_sql`, so `Option<PgText>` keeps them distinct
/// for every column type.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        let text = match *ty {
            Type::BOOL => bool::from_sql(ty, raw)?.to_string(),
            Type::INT2 => i16::from_sql(ty, raw)?.to_string(),
            Type::INT4 => i32::from_sql(ty, raw)?.to_string(),
            Type::INT8 => i64::from_sql(ty, raw)?.to_string(),
            Type::OID => u32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT4 => f32::from_sql(ty, raw)?.to_string(),
            Type::FLOAT8 => f64::from_sql(ty, raw)?.to_string(),
            Type::NUMERIC => numeric_text(raw)?,
            Type::UUID => uuid_text(raw)?,
            Type::INET | Type::CIDR => inet_text(raw)?,
            Type::BYTEA => format!("[{} bytes]", raw.len()),
            Type::DATE => NaiveDate::from_sql(ty, raw)?.to_string(),
            Type::TIME => NaiveTime::from_sql(ty, raw)?.to_string(),
            Type::TIMESTAMP => NaiveDateTime::from_sql(ty, raw)?.to_string(),
            Type::TIMESTAMPTZ => DateTime::<Utc>::from_sql(ty, raw)?.to_string(),
            Type::JSON | Type::JSONB => serde_json::Value::from_sql(ty, raw)?.to_string(),
            _ => match ty.kind() {
                Kind::Array(_) => {
                    let items = Vec::<Option<PgText>>::from_sql(ty, raw)?;
                    let items: Vec<String> = items
                        .into_iter()
                        .map(|item| item.map_or_else(|| "NULL".to_string(), |t| t.0))
                        .collect();
                    format!("{{{}}}", items.join(","))
                }
                Kind::Domain(inner) => PgText::from_sql(inner, raw)?.0,
                // enum labels and xml travel as plain text
                Kind::Enum(_) => std::str::from_utf8(raw)?.to_string(),
                _ if *ty == Type::XML || <String as FromSql>::accepts(ty) => {
                    std::str::from_utf8(raw)?.to_string()
                }
                _ => return Err(format!("no text rendering for type {}", ty.name()).into()),
            },
        };
        Ok(PgText(text))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn extract_cell(row: &Row, idx: usize, pg_type: &Type) -> Cell {
    match row.try_get::<_, Option<PgText>>(idx) {
        Ok(value) => Cell::from(value.map(|PgText(text)| text)),
        Err(e) => {
            debug!(column = idx, error = %e, "cannot render value as text");
            Cell::Text(format!("<{}>", pg_type.name()))
        }
    }
}

fn be_u16(raw: &[u8], at: usize) -> std::result::Result<u16, BoxError> {
    raw.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated value".into())
}

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits.
fn numeric_text(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let ndigits = be_u16(raw, 0)? as usize;
    let weight = be_u16(raw, 2)? as i16 as i32;
    let sign = be_u16(raw, 4)?;
    let dscale = be_u16(raw, 6)? as usize;
    let digits = (0..ndigits)
        .map(|i| be_u16(raw, 8 + i * 2))
        .collect::<std::result::Result<Vec<u16>, _>>()?;

    match sign {
        0xC000 => return Ok("NaN".to_string()),
        0xD000 => return Ok("Infinity".to_string()),
        0xF000 => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digit = |pos: i32| {
        usize::try_from(pos)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for pos in 1..=weight {
            out.push_str(&format!("{:04}", digit(pos)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut pos = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(pos)));
            pos += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

fn uuid_text(raw: &[u8]) -> std::result::Result<String, BoxError> {
    if raw.len() != 16 {
        return Err("invalid uuid length".into());
    }
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

/// Binary INET/CIDR: family, prefix bits, is_cidr flag, address length, address.
fn inet_text(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let (family, bits) = match raw {
        [family, bits, _, _, ..] => (*family, *bits),
        _ => return Err("truncated inet".into()),
    };
    let addr = &raw[4..];
    let (ip, max_bits): (IpAddr, u8) = match (family, addr.len()) {
        (2, 4) => (IpAddr::from([addr[0], addr[1], addr[2], addr[3]]), 32),
        (3, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            (IpAddr::from(octets), 128)
        }
        _ => return Err("unknown inet family".into()),
    };
    let is_cidr = raw[2] != 0;
    if is_cidr || bits != max_bits {
        Ok(format!("{}/{}", ip, bits))
    } else {
        Ok(ip.to_string())
    }
}

/// Build a TLS connector from the configured verification settings.
fn build_tls_connector(options: &PostgresTlsOptions) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();

    if options.accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    } else if let Some(ca_path) = &options.ca_cert_path {
        let pem = std::fs::read_to_string(ca_path).map_err(|e| {
            EngineError::Configuration(format!(
                "failed to read CA certificate file {}: {}",
                ca_path.display(),
                e
            ))
        })?;
        for block in pem_blocks(&pem) {
            let cert = native_tls::Certificate::from_pem(block.as_bytes()).map_err(|e| {
                EngineError::Configuration(format!("failed to parse CA certificate: {}", e))
            })?;
            builder.add_root_certificate(cert);
        }
    }

    let connector = builder
        .build()
        .map_err(|e| EngineError::Configuration(format!("failed to build TLS connector: {}", e)))?;
    Ok(MakeTlsConnector::new(connector))
}

/// Split a PEM bundle into individual certificate blocks.
fn pem_blocks(pem: &str) -> Vec<String> {
    const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
    const END: &str = "-----END CERTIFICATE-----";

    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(BEGIN) {
        let Some(end) = rest[start..].find(END) else {
            break;
        };
        let stop = start + end + END.len();
        blocks.push(rest[start..stop].to_string());
        rest = &rest[stop..];
    }
    blocks
}
