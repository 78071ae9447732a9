use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SpotLedgerAuthSource;
use crate::canvas::CanvasRegistry;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SpotFilter, SqlError};
use crate::upload::{Upload, UploadError, UploadStore};

pub const DEFAULT_CANVAS: &str = "default";

pub struct SpotHandler {
    canvases: Arc<CanvasRegistry>,
    uploads: Arc<dyn UploadStore>,
    query_parser: Arc<SpotQueryParser>,
}

impl SpotHandler {
    pub fn new(canvases: Arc<CanvasRegistry>, uploads: Arc<dyn UploadStore>) -> Self {
        Self {
            canvases,
            uploads,
            query_parser: Arc::new(SpotQueryParser),
        }
    }

    /// The canvas is the database name the client connected with.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CANVAS.to_string());
        self.canvases.get_or_create(&db).map_err(|e| {
            user_error("3D000", format!("canvas {db:?} unavailable: {e}"))
        })
    }

    /// Parse and run one statement, recording the request metrics.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;

        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::SelectAvailability { selection } => {
                let availability = engine
                    .check_availability(&selection)
                    .await
                    .map_err(engine_err)?;
                let conflicts = serde_json::to_string(&availability.conflicting_spots)
                    .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                let schema = Arc::new(availability_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&availability.available)?;
                encoder.encode_field(&availability.has_collision)?;
                encoder.encode_field(&to_i64(availability.conflicting_spots.len() as u64))?;
                encoder.encode_field(&conflicts)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectSelection { selection } => {
                let b = engine.selection_info(&selection);
                let schema = Arc::new(selection_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&b.min_x)?;
                encoder.encode_field(&b.min_y)?;
                encoder.encode_field(&b.max_x)?;
                encoder.encode_field(&b.max_y)?;
                encoder.encode_field(&to_i64(b.width()))?;
                encoder.encode_field(&to_i64(b.height()))?;
                encoder.encode_field(&to_i64(b.total_cells()))?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::InsertSpot { spot } => {
                let spot = engine.create_spot(spot).await.map_err(engine_err)?;
                Ok(spot_rows(&[spot], format))
            }
            Command::SelectSpots { filter } => {
                let spots = match filter {
                    SpotFilter::All => engine.list_spots(),
                    SpotFilter::Id(id) => vec![engine.get_spot(&id).map_err(engine_err)?],
                    SpotFilter::Owner(wallet) => engine.spots_by_owner(&wallet).map_err(engine_err)?,
                };
                Ok(spot_rows(&spots, format))
            }
            Command::SelectStats => {
                let stats = engine.get_stats();
                let schema = Arc::new(stats_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&to_i64(stats.total_pixels_sold))?;
                encoder.encode_field(&to_i64(stats.total_spots as u64))?;
                encoder.encode_field(&to_i64(stats.unique_owners as u64))?;
                encoder.encode_field(&stats.last_updated)?;
                Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::SelectLeaderboard { owner_wallet } => {
                let mut entries = engine.leaderboard();
                if let Some(wallet) = owner_wallet {
                    let wallet = wallet.trim().to_string();
                    entries.retain(|e| e.owner_wallet == wallet);
                }
                let schema = Arc::new(leaderboard_schema(format));
                let rows: Vec<PgWireResult<DataRow>> = entries
                    .iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&to_i64(e.rank as u64))?;
                        encoder.encode_field(&e.owner_wallet)?;
                        encoder.encode_field(&to_i64(e.spots as u64))?;
                        encoder.encode_field(&to_i64(e.pixels))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows_response(schema, rows))
            }
            Command::SelectWhitelist { wallet } => {
                let status = engine.whitelist_status(&wallet).await.map_err(engine_err)?;
                whitelist_row(&status, format)
            }
            Command::InsertWhitelist { wallet, allowance } => {
                engine
                    .grant_allowance(&wallet, allowance)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteWhitelist { wallet } => {
                engine.revoke_whitelist(&wallet).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ConsumeAllowance { wallet, amount } => {
                let status = engine
                    .consume_allowance(&wallet, amount)
                    .await
                    .map_err(engine_err)?;
                whitelist_row(&status, format)
            }
            Command::InsertUpload {
                spot_id,
                file_name,
                content_type,
                data,
            } => {
                let upload = self
                    .uploads
                    .upload(&spot_id, &file_name, &content_type, data.into())
                    .await
                    .map_err(upload_err)?;
                upload_row(&upload, format)
            }
        }
    }
}

fn rows_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn spot_rows(spots: &[Spot], format: &Format) -> Response {
    let schema = Arc::new(spot_schema(format));
    let rows: Vec<PgWireResult<DataRow>> = spots
        .iter()
        .map(|spot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&spot.id.to_string())?;
            encoder.encode_field(&spot.x)?;
            encoder.encode_field(&spot.y)?;
            encoder.encode_field(&spot.width)?;
            encoder.encode_field(&spot.height)?;
            encoder.encode_field(&spot.visual.image_url().map(str::to_string))?;
            encoder.encode_field(&spot.visual.color_hex().map(str::to_string))?;
            encoder.encode_field(&spot.link_url)?;
            encoder.encode_field(&spot.owner_wallet)?;
            encoder.encode_field(&spot.tx_signature)?;
            encoder.encode_field(&spot.created_at)?;
            encoder.encode_field(&spot.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    rows_response(schema, rows)
}

fn whitelist_row(status: &WhitelistStatus, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(whitelist_schema(format));
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&status.wallet)?;
    encoder.encode_field(&status.is_whitelisted)?;
    encoder.encode_field(&i64::from(status.allowance))?;
    Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
}

fn upload_row(upload: &Upload, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(upload_schema(format));
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&upload.url)?;
    encoder.encode_field(&upload.path)?;
    Ok(rows_response(schema, vec![Ok(encoder.take_row())]))
}

/// Counts are reported as int8; anything past `i64::MAX` saturates.
fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

// ── Result schemas ───────────────────────────────────────────────

/// Field list for a result, each column encoded in the format the client
/// asked for at bind time. Missing per-column codes fall back to text.
fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| {
            let field_format = match format {
                Format::Individual(codes) => codes
                    .get(i)
                    .map_or(FieldFormat::Text, |code| FieldFormat::from(*code)),
                _ => format.format_for(i),
            };
            FieldInfo::new((*name).into(), None, None, ty.clone(), field_format)
        })
        .collect()
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("available", Type::BOOL),
            ("has_collision", Type::BOOL),
            ("conflict_count", Type::INT8),
            ("conflicting_spots", Type::TEXT),
        ],
        format,
    )
}

fn selection_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("min_x", Type::INT8),
            ("min_y", Type::INT8),
            ("max_x", Type::INT8),
            ("max_y", Type::INT8),
            ("width", Type::INT8),
            ("height", Type::INT8),
            ("total_cells", Type::INT8),
        ],
        format,
    )
}

fn spot_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("x", Type::INT8),
            ("y", Type::INT8),
            ("width", Type::INT8),
            ("height", Type::INT8),
            ("image_url", Type::VARCHAR),
            ("color_hex", Type::VARCHAR),
            ("link_url", Type::VARCHAR),
            ("owner_wallet", Type::VARCHAR),
            ("tx_signature", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
        format,
    )
}

fn stats_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("total_pixels_sold", Type::INT8),
            ("total_spots", Type::INT8),
            ("unique_owners", Type::INT8),
            ("last_updated", Type::INT8),
        ],
        format,
    )
}

fn leaderboard_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("rank", Type::INT8),
            ("owner_wallet", Type::VARCHAR),
            ("spots", Type::INT8),
            ("pixels", Type::INT8),
        ],
        format,
    )
}

fn whitelist_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("wallet", Type::VARCHAR),
            ("is_whitelisted", Type::BOOL),
            ("allowance", Type::INT8),
        ],
        format,
    )
}

fn upload_schema(format: &Format) -> Vec<FieldInfo> {
    schema(&[("url", Type::VARCHAR), ("path", Type::VARCHAR)], format)
}

/// Result columns of a statement, judged from its verb and target table so
/// that statements with `$n` placeholders can be described before binding.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.trim_matches('"').to_lowercase())
        .collect();
    let Some(verb) = words.first() else {
        return vec![];
    };
    let target = |keyword: &str| {
        words
            .iter()
            .position(|w| w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(String::as_str)
    };
    match (verb.as_str(), target("from"), target("into")) {
        ("select", Some("availability"), _) => availability_schema(format),
        ("select", Some("selection"), _) => selection_schema(format),
        ("select", Some("spots"), _) | ("insert", _, Some("spots")) => spot_schema(format),
        ("select", Some("stats"), _) => stats_schema(format),
        ("select", Some("leaderboard"), _) => leaderboard_schema(format),
        ("select", Some("whitelist"), _) | ("insert", _, Some("allowance_uses")) => {
            whitelist_schema(format)
        }
        ("insert", _, Some("uploads")) => upload_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SpotHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SpotQueryParser;

#[async_trait]
impl QueryParser for SpotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SpotHandler {
    type Statement = String;
    type QueryParser = SpotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(client, &sql, &portal.result_column_format).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$N` placeholders outside quoted literals and identifiers, as
/// (byte range, N) in statement order.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // `''` inside a literal closes and reopens it.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                let digits = bytes[i + 1..].iter().take_while(|d| d.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((start..i + 1 + digits, n));
                }
                i += digits;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Inline bound text parameters as quoted literals in one pass over the
/// statement, so text inside a bound value is never treated as a placeholder.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        result.push_str(&sql[copied..range.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes);
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            // Unbound placeholders stay as written and fail to parse.
            None => result.push_str(&sql[range.clone()]),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SpotFactory {
    handler: Arc<SpotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SpotLedgerAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SpotFactory {
    pub fn new(canvases: Arc<CanvasRegistry>, uploads: Arc<dyn UploadStore>, password: String) -> Self {
        let auth_source = SpotLedgerAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SpotHandler::new(canvases, uploads)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SpotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    canvases: Arc<CanvasRegistry>,
    uploads: Arc<dyn UploadStore>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SpotFactory::new(canvases, uploads, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput(_) => "22023",
        EngineError::OutOfBounds { .. } => "22003",
        EngineError::OverlapConflict(_) => "23P01",
        EngineError::StoreUnavailable(_) => "58030",
        EngineError::NotFound(_) => "02000",
        EngineError::LimitExceeded(_) => "54000",
    }
}

pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidValue(_) => "22P02",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        _ => "42601",
    }
}

pub fn upload_sqlstate(e: &UploadError) -> &'static str {
    match e {
        UploadError::InvalidInput(_) => "22023",
        UploadError::UnsupportedType(_) => "22023",
        UploadError::TooLarge { .. } => "54000",
        UploadError::AlreadyExists(_) => "23505",
        UploadError::Io(_) => "58030",
    }
}

fn upload_err(e: UploadError) -> PgWireError {
    user_error(upload_sqlstate(&e), e.to_string())
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn every_engine_error_has_its_own_state() {
        let errors = [
            EngineError::InvalidInput("x".into()),
            EngineError::OutOfBounds { min_x: 0, min_y: 0, max_x: 1000, max_y: 0 },
            EngineError::OverlapConflict(vec![Ulid::new()]),
            EngineError::StoreUnavailable("disk".into()),
            EngineError::NotFound("spot".into()),
            EngineError::LimitExceeded("too long"),
        ];
        let mut states: Vec<&str> = errors.iter().map(engine_sqlstate).collect();
        states.sort();
        states.dedup();
        assert_eq!(states.len(), errors.len());
        assert_eq!(engine_sqlstate(&errors[2]), "23P01");
    }

    #[test]
    fn bad_literal_is_a_data_exception() {
        assert_eq!(sql_sqlstate(&SqlError::InvalidValue("1.5".into())), "22P02");
        assert_eq!(sql_sqlstate(&SqlError::Parse("near FORM".into())), "42601");
    }

    #[test]
    fn result_schema_by_target_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql, &Format::UnifiedText).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("SELECT * FROM availability WHERE start_x = $1 AND start_y = $2 AND end_x = $3 AND end_y = $4"),
            ["available", "has_collision", "conflict_count", "conflicting_spots"]
        );
        assert_eq!(names("insert into spots(x, y, width, height, owner_wallet) values ($1, $2, $3, $4, $5)").len(), 12);
        assert_eq!(names("INSERT INTO allowance_uses (wallet, amount) VALUES ($1, $2)")[1], "is_whitelisted");
        assert!(names("INSERT INTO whitelist (wallet, allowance) VALUES ($1, $2)").is_empty());
        assert!(names("DELETE FROM whitelist WHERE wallet = $1").is_empty());
        assert_eq!(names("SELECT * FROM stats;").len(), 4);
        assert!(names("").is_empty());
    }

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM stats"), 0);
        assert_eq!(count_params("VALUES ($2, $1, $10)"), 10);
        assert_eq!(count_params("costs $ nothing"), 0);
        assert_eq!(count_params("VALUES ('$7', \"$8\", $1)"), 1);
    }

    #[test]
    fn bound_values_are_quoted_once() {
        let params = [
            Some(Bytes::from_static(b"o'brien")),
            Some(Bytes::from_static(b"$1 and $2")),
            None,
        ];
        assert_eq!(
            substitute_params("VALUES ($1, $2, $3, '$1')", &params),
            "VALUES ('o''brien', '$1 and $2', NULL, '$1')"
        );
        assert_eq!(
            substitute_params("SELECT $10, $1", &params),
            "SELECT $10, 'o''brien'"
        );
        assert_eq!(substitute_params("WHERE a = 'it''s $2'", &params), "WHERE a = 'it''s $2'");
    }

    #[test]
    fn result_formats_follow_the_portal() {
        let binary = availability_schema(&Format::UnifiedBinary);
        assert!(binary.iter().all(|f| f.format() == FieldFormat::Binary));

        let mixed = whitelist_schema(&Format::Individual(vec![0, 1]));
        assert_eq!(mixed[0].format(), FieldFormat::Text);
        assert_eq!(mixed[1].format(), FieldFormat::Binary);
        assert_eq!(mixed[2].format(), FieldFormat::Text);
    }
}
