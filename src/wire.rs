use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{ScopeAuthSource, Session, resolve_session};
use crate::dispatch::{self, Column, ColumnKind, DispatchError, Outcome};
use crate::engine::Engine;
use crate::sql;
use crate::tenant::TenantManager;

pub struct ScopeHandler {
    tenant_manager: Arc<TenantManager>,
    admin_login: String,
    query_parser: Arc<ScopeQueryParser>,
}

impl ScopeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_login: String) -> Self {
        Self {
            tenant_manager,
            admin_login,
            query_parser: Arc::new(ScopeQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    fn resolve_session<C: ClientInfo>(&self, client: &C, engine: &Engine) -> PgWireResult<Session> {
        let login = client.metadata().get("user").cloned().unwrap_or_default();
        resolve_session(engine, &login, &self.admin_login).ok_or_else(|| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            dispatch_err(DispatchError::Unauthenticated(login))
        })
    }

    async fn run_statement<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let session = self.resolve_session(client, &engine)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let outcome = dispatch::execute(&engine, &session, cmd)
            .await
            .map_err(dispatch_err)?;
        outcome_response(outcome)
    }
}

fn field_type(kind: ColumnKind) -> Type {
    match kind {
        ColumnKind::Text => Type::VARCHAR,
        ColumnKind::Int8 => Type::INT8,
        ColumnKind::Bool => Type::BOOL,
    }
}

fn row_schema(columns: &[Column]) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|c| {
            FieldInfo::new(
                c.name.into(),
                None,
                None,
                field_type(c.kind),
                FieldFormat::Text,
            )
        })
        .collect()
}

/// Result columns a statement will produce, for Describe.
fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| row_schema(dispatch::schema_for_table(&table)))
        .unwrap_or_default()
}

fn outcome_response(outcome: Outcome) -> PgWireResult<Response> {
    match outcome {
        Outcome::Executed { tag, rows } => Ok(Response::Execution(Tag::new(tag).with_rows(rows))),
        Outcome::Rows { columns, rows } => {
            let schema = Arc::new(row_schema(columns));
            let encoded: Vec<PgWireResult<_>> = rows
                .into_iter()
                .map(|row| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    for value in &row {
                        encoder.encode_field(value)?;
                    }
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(
                schema,
                stream::iter(encoded),
            )))
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for ScopeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_statement(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ScopeQueryParser;

#[async_trait]
impl QueryParser for ScopeQueryParser {
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
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ScopeHandler {
    type Statement = String;
    type QueryParser = ScopeQueryParser;

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
        let sql = substitute_params(portal);
        self.run_statement(client, &sql).await
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
            describe(&target.statement),
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace `$1`, `$2`, ... with the bound text parameters as quoted
/// literals, in one pass over the statement. Placeholders inside quoted text
/// are left alone and bound values are never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
                    digits.push(d);
                }
                let bound = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match bound {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(None) => out.push_str("NULL"),
                    None => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ScopeFactory {
    handler: Arc<ScopeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ScopeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ScopeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, admin_login: String) -> Self {
        let auth_source = ScopeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ScopeHandler::new(tenant_manager, admin_login)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ScopeFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    admin_login: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = ScopeFactory::new(tenant_manager, password, admin_login);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn dispatch_err(e: DispatchError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
