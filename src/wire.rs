use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{
    AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler,
};
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{TlsAcceptor, process_socket};
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::service::AvailabilityService;
use crate::sql::{self, BlockRow, Command, SqlError};

// ── Authentication ───────────────────────────────────────────────

/// Single shared password for every login.
#[derive(Debug)]
pub struct LedgerAuthSource {
    password: String,
}

impl LedgerAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LedgerAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Query handling ───────────────────────────────────────────────

pub struct LedgerHandler {
    engine: Arc<Engine>,
    availability: AvailabilityService,
    query_parser: Arc<LedgerQueryParser>,
}

impl LedgerHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            availability: AvailabilityService::new(engine.clone()),
            engine,
            query_parser: Arc::new(LedgerQueryParser),
        }
    }

    /// Parse and execute one statement, recording metrics for it.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!("executing {label}");

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertBlock(row) => {
                let (id, venue_id, range, label) = block_parts(row)?;
                self.engine
                    .insert_block(id, venue_id, range, label)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertBlocks(rows) => {
                let blocks = rows
                    .into_iter()
                    .map(|row| {
                        let (id, venue_id, range, label) = block_parts(row)?;
                        Ok(NewBlock {
                            id,
                            venue_id,
                            range,
                            label,
                        })
                    })
                    .collect::<PgWireResult<Vec<_>>>()?;
                let inserted = self
                    .engine
                    .batch_insert_blocks(blocks)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(inserted.len())))
            }
            Command::DeleteBlock { id } => {
                self.engine.remove_block(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBlocks { venue_id, id } => {
                let mut blocks = match &venue_id {
                    Some(venue_id) => self.availability.get_blocked_ranges(venue_id).await,
                    None => Vec::new(),
                };
                if let Some(id) = id {
                    if venue_id.is_some() {
                        blocks.retain(|b| b.id == id);
                    } else {
                        blocks.extend(self.engine.get_block(id).await);
                    }
                }
                block_rows(blocks)
            }
            Command::SelectConflicts {
                venue_id,
                start,
                end,
            } => {
                let availability = self
                    .availability
                    .check_range(&venue_id, start, end)
                    .await
                    .map_err(engine_err)?;
                block_rows(availability.conflicting)
            }
            Command::SelectAvailability {
                venue_id,
                start,
                end,
                min_days,
            } => {
                let window = DateRange::new(start, end).map_err(|e| engine_err(e.into()))?;
                let free = self
                    .availability
                    .free_ranges(&venue_id, &window, min_days)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let venue_str = venue_id.to_string();
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|range| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&venue_str)?;
                        encoder.encode_field(&range.start().to_string())?;
                        encoder.encode_field(&range.end().to_string())?;
                        encoder.encode_field(&range.days())?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                )))
            }
        }
    }
}

fn block_parts(row: BlockRow) -> PgWireResult<(ulid::Ulid, VenueId, DateRange, Option<String>)> {
    let range = DateRange::new(row.start, row.end).map_err(|e| engine_err(e.into()))?;
    Ok((row.id, row.venue_id, range, row.label))
}

fn block_rows(blocks: Vec<Interval>) -> PgWireResult<Response> {
    let schema = Arc::new(block_schema());
    let rows: Vec<PgWireResult<_>> = blocks
        .into_iter()
        .map(|block| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&block.id.to_string())?;
            encoder.encode_field(&block.venue_id.to_string())?;
            encoder.encode_field(&block.range.start().to_string())?;
            encoder.encode_field(&block.range.end().to_string())?;
            encoder.encode_field(&block.label)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Columns of `blocks` and `conflicts`. Dates are ISO `YYYY-MM-DD` text.
fn block_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("venue_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("label", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("venue_id", Type::VARCHAR),
        text_field("start", Type::VARCHAR),
        text_field("end", Type::VARCHAR),
        text_field("days", Type::INT8),
    ]
}

/// Result columns a statement will produce, judged from its text so it works
/// before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("BLOCKS") || upper.contains("CONFLICTS") {
        block_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for LedgerHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LedgerQueryParser;

#[async_trait]
impl QueryParser for LedgerQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LedgerHandler {
    type Statement = String;
    type QueryParser = LedgerQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql).await
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
            result_schema(&target.statement),
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
        )))
    }
}

/// Byte ranges and indexes of `$N` placeholders outside quoted literals
/// and quoted identifiers, left to right.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which nets out the same.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute `$1, $2, ...` with bound text parameters as quoted literals,
/// in one pass; inserted values are never rescanned. Placeholders with no
/// bound parameter are left as written.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..span.start]);
        match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = span.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LedgerFactory {
    handler: Arc<LedgerHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<LedgerAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LedgerFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = LedgerAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(LedgerHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LedgerFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = LedgerFactory::new(engine, password);
    process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::InvalidDate(_) => "22007",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    }
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
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM blocks"), 0);
        assert_eq!(count_params("SELECT * FROM blocks WHERE venue_id = $1"), 1);
        assert_eq!(count_params("VALUES ($2, $1, $10)"), 10);
        assert_eq!(count_params("price is $ 5"), 0);
    }

    #[test]
    fn substitute_params_quotes_and_nulls() {
        let params: Vec<Option<Vec<u8>>> = vec![
            Some(b"O'Brien hall".to_vec()),
            None,
            Some(b"2026-02-10".to_vec()),
        ];
        let sql = substitute_params("VALUES ($1, $2, $3)", &params);
        assert_eq!(sql, "VALUES ('O''Brien hall', NULL, '2026-02-10')");
    }

    #[test]
    fn substitute_params_double_digit_placeholders() {
        let params: Vec<Option<Vec<u8>>> = (1..=10).map(|i| Some(i.to_string().into_bytes())).collect();
        let sql = substitute_params("$1,$10", &params);
        assert_eq!(sql, "'1','10'");
    }

    #[test]
    fn dollar_signs_in_values_are_not_rescanned() {
        let params: Vec<Option<Vec<u8>>> = vec![
            Some(b"hall".to_vec()),
            Some(b"deposit $2 paid, $1 due".to_vec()),
        ];
        let sql = substitute_params("VALUES ($1, $2)", &params);
        assert_eq!(sql, "VALUES ('hall', 'deposit $2 paid, $1 due')");
    }

    #[test]
    fn placeholders_inside_quotes_are_literal_text() {
        let params: Vec<Option<Vec<u8>>> = vec![Some(b"hall".to_vec())];
        let sql = substitute_params(r#"SELECT '$1', "$1" FROM blocks WHERE venue_id = $1"#, &params);
        assert_eq!(sql, r#"SELECT '$1', "$1" FROM blocks WHERE venue_id = 'hall'"#);
        assert_eq!(count_params("VALUES ('it''s $3', $1)"), 1);
    }

    #[tokio::test]
    async fn bound_label_with_placeholder_text_is_stored_verbatim() {
        let engine = Arc::new(Engine::ephemeral(Arc::new(crate::notify::NotifyHub::new())));
        let handler = LedgerHandler::new(engine.clone());
        let id = Ulid::new().to_string();
        let params: Vec<Option<Vec<u8>>> = [id.as_str(), "hall", "2026-02-10", "2026-02-12", "deposit $2 paid"]
            .iter()
            .map(|p| Some(p.as_bytes().to_vec()))
            .collect();
        let sql = substitute_params(
            r#"INSERT INTO blocks (id, venue_id, start, "end", label) VALUES ($1, $2, $3, $4, $5)"#,
            &params,
        );

        handler.run(&sql).await.unwrap();
        let blocks = engine.list_for_venue(&VenueId::from("hall")).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].label.as_deref(), Some("deposit $2 paid"));
    }

    #[test]
    fn schema_by_statement() {
        assert_eq!(result_schema("SELECT * FROM availability WHERE venue_id = $1").len(), 4);
        assert_eq!(result_schema("select * from conflicts where date = $2").len(), 5);
        assert_eq!(result_schema("SELECT * FROM blocks WHERE id = $1").len(), 5);
        assert!(result_schema("INSERT INTO blocks VALUES ($1, $2, $3, $4)").is_empty());
        assert!(result_schema("DELETE FROM blocks WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        let id = Ulid::new();
        assert_eq!(engine_sqlstate(&EngineError::Conflict(id)), "23P01");
        assert_eq!(engine_sqlstate(&EngineError::NotFound(id)), "02000");
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("too many venues")), "54000");
        assert_eq!(sql_sqlstate(&SqlError::InvalidDate("2026-13-01".into())), "22007");
        assert_eq!(sql_sqlstate(&SqlError::Empty), "42601");
    }

    #[tokio::test]
    async fn handler_runs_statements_end_to_end() {
        let engine = Arc::new(Engine::ephemeral(Arc::new(crate::notify::NotifyHub::new())));
        let handler = LedgerHandler::new(engine.clone());
        let id = Ulid::new();

        let response = handler
            .run(&format!(
                r#"INSERT INTO blocks (id, venue_id, start, "end") VALUES ('{id}', 'hall', '2026-02-10', '2026-02-15')"#
            ))
            .await
            .unwrap();
        assert!(matches!(response, Response::Execution(_)));
        assert_eq!(engine.list_for_venue(&VenueId::from("hall")).await.len(), 1);

        let result = handler
            .run(&format!(
                r#"INSERT INTO blocks (id, venue_id, start, "end") VALUES ('{}', 'hall', '2026-02-15', '2026-02-20')"#,
                Ulid::new()
            ))
            .await;
        assert!(matches!(result, Err(PgWireError::UserError(_))));

        let result = handler
            .run(&format!(
                r#"INSERT INTO blocks (id, venue_id, start, "end") VALUES ('{}', 'hall', '2026-02-20', '2026-02-10')"#,
                Ulid::new()
            ))
            .await;
        assert!(matches!(result, Err(PgWireError::UserError(_))));
        assert_eq!(engine.list_for_venue(&VenueId::from("hall")).await.len(), 1);

        handler
            .run(&format!("DELETE FROM blocks WHERE id = '{id}'"))
            .await
            .unwrap();
        assert!(engine.list_for_venue(&VenueId::from("hall")).await.is_empty());
    }
}
