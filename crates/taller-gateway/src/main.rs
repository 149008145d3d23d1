use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{error, info};
use uuid::Uuid;

use taller_core::{
    CashSession, Clock, DeviceStatus, DomainError, EntryType, LedgerEntry, Product, SystemClock,
};
use taller_ledger::{breakdown, dates, summary};
use taller_platform::{ServiceConfig, connect_database};

const DEFAULT_TRANSACTION_LIMIT: i64 = 500;
const MAX_TRANSACTION_LIMIT: i64 = 1000;
const DEFAULT_TOP_PRODUCTS_LIMIT: i64 = 10;
const MAX_TOP_PRODUCTS_LIMIT: i64 = 100;
const MAX_INVOICE_LIMIT: i64 = 100;

const PURCHASE_CATEGORY: &str = "purchase";
const SALE_CATEGORY: &str = "sale";

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransactionRequest {
    date: Option<String>,
    #[serde(rename = "type")]
    entry_type: String,
    amount: Decimal,
    description: String,
    category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTransactionsQuery {
    from: Option<String>,
    to: Option<String>,
    #[serde(rename = "type")]
    entry_type: Option<String>,
    category: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionView {
    id: Uuid,
    date: DateTime<Utc>,
    #[serde(rename = "type")]
    entry_type: EntryType,
    amount: Decimal,
    description: String,
    category: Option<String>,
    product_id: Option<Uuid>,
    product_name: Option<String>,
    invoice_id: Option<Uuid>,
    quantity: Option<i32>,
    supplier: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct TransactionListResponse {
    items: Vec<TransactionView>,
}

#[derive(Debug, Clone, Deserialize)]
struct DailyQuery {
    date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DailySummaryView {
    date: String,
    income: Decimal,
    expense: Decimal,
    net: Decimal,
    opening_balance: Decimal,
    closing_balance: Decimal,
    transactions: Vec<TransactionView>,
}

#[derive(Debug, Clone, Deserialize)]
struct RangeQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RangeSummaryResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    days: Vec<summary::DayRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct CashSessionQuery {
    date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetCashSessionRequest {
    date: Option<String>,
    date_key: Option<String>,
    opening_balance: Decimal,
    notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct CashSessionView {
    date: DateTime<Utc>,
    date_key: String,
    opening_balance: Decimal,
    notes: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ReportSummaryQuery {
    from: Option<String>,
    to: Option<String>,
    granularity: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ReportSummaryResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    granularity: String,
    rows: Vec<summary::PeriodRow>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopProductsQuery {
    from: Option<String>,
    to: Option<String>,
    sort_by: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopProductView {
    product_id: Option<Uuid>,
    name: String,
    quantity: i64,
    value: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopProductsResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    sort_by: String,
    rows: Vec<TopProductView>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExpensesByCategoryQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ExpensesByCategoryResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    rows: Vec<breakdown::CategoryExpense>,
    total: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProductRequest {
    name: String,
    quantity: Option<i32>,
    price: Option<Decimal>,
    supplier: Option<String>,
    barcode: Option<String>,
    category: Option<String>,
    min_stock: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateProductRequest {
    name: Option<String>,
    quantity: Option<i32>,
    price: Option<Decimal>,
    supplier: Option<String>,
    barcode: Option<String>,
    category: Option<String>,
    min_stock: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListProductsQuery {
    q: Option<String>,
    category: Option<String>,
    limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProductView {
    id: Uuid,
    name: String,
    quantity: i32,
    price: Decimal,
    supplier: Option<String>,
    barcode: Option<String>,
    category: Option<String>,
    min_stock: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct ProductListResponse {
    items: Vec<ProductView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustInventoryRequest {
    items: Vec<AdjustItemRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdjustItemRequest {
    product_id: Uuid,
    quantity_used: i32,
}

#[derive(Debug, Clone, Serialize)]
struct AdjustInventoryResponse {
    updated: i64,
    items: Vec<ProductView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPurchaseRequest {
    quantity: i32,
    unit_cost: Decimal,
    supplier: Option<String>,
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordSaleRequest {
    quantity: i32,
    unit_price: Decimal,
    notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct StockMovementResponse {
    product: ProductView,
    transaction: Option<TransactionView>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInvoiceRequest {
    client: Uuid,
    device: Option<Uuid>,
    date: Option<String>,
    items: Vec<InvoiceItemRequest>,
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceItemRequest {
    product: Option<Uuid>,
    description: String,
    quantity: i32,
    unit_price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceItemView {
    product_id: Option<Uuid>,
    description: String,
    quantity: i32,
    unit_price: Decimal,
    line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceView {
    id: Uuid,
    client_id: Uuid,
    client_name: Option<String>,
    device_id: Option<Uuid>,
    device_label: Option<String>,
    total: Decimal,
    notes: Option<String>,
    items: Vec<InvoiceItemView>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct InvoiceListResponse {
    items: Vec<InvoiceView>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListInvoicesQuery {
    limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct InvoiceIncomeQuery {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct InvoiceIncomeResponse {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    total: Decimal,
    count: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateClientRequest {
    name: String,
    phone: String,
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateClientRequest {
    name: Option<String>,
    phone: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientView {
    id: Uuid,
    name: String,
    phone: String,
    email: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct ClientListResponse {
    items: Vec<ClientView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientDetailView {
    id: Uuid,
    name: String,
    phone: String,
    email: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    devices: Vec<DeviceView>,
}

#[derive(Debug, Clone, Deserialize)]
struct CreateDeviceRequest {
    client: Uuid,
    brand: String,
    model: String,
    issue: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UpdateDeviceRequest {
    brand: Option<String>,
    model: Option<String>,
    issue: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListDevicesQuery {
    status: Option<String>,
    client: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceView {
    id: Uuid,
    client_id: Uuid,
    client_name: Option<String>,
    brand: String,
    model: String,
    issue: String,
    status: DeviceStatus,
    received_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct DeviceListResponse {
    items: Vec<DeviceView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDetailView {
    id: Uuid,
    client_id: Uuid,
    client_name: Option<String>,
    brand: String,
    model: String,
    issue: String,
    status: DeviceStatus,
    received_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    history: Vec<RepairEventView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepairEventView {
    id: Uuid,
    device_id: Uuid,
    status: DeviceStatus,
    comment: Option<String>,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
struct RepairListResponse {
    items: Vec<RepairEventView>,
}

#[derive(Debug, Clone, Deserialize)]
struct ListRepairsQuery {
    device: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecordRepairRequest {
    device: Uuid,
    status: String,
    comment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct RepairUpdateResponse {
    device: DeviceView,
    event: RepairEventView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardSummaryResponse {
    active_repairs: i64,
    income_last30_days: Decimal,
    recent_invoices: Vec<InvoiceView>,
    low_inventory: Vec<ProductView>,
}

#[derive(Debug, Clone, Serialize)]
struct MessageResponse {
    message: String,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "taller_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:4000")?;
    let pool = connect_database(&config.database_url).await?;

    let state = AppState {
        pool,
        clock: Arc::new(SystemClock),
    };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/transactions",
            get(list_transactions).post(create_transaction),
        )
        .route("/transactions/{transaction_id}", delete(delete_transaction))
        .route("/daily", get(daily_summary))
        .route("/range", get(range_summary))
        .route(
            "/cash-session",
            get(get_cash_session).post(set_cash_session),
        )
        .route("/reports/summary", get(report_summary))
        .route("/reports/summary.csv", get(report_summary_csv))
        .route("/reports/top-products", get(report_top_products))
        .route("/reports/top-products.csv", get(report_top_products_csv))
        .route(
            "/reports/expenses-by-category",
            get(report_expenses_by_category),
        )
        .route(
            "/reports/expenses-by-category.csv",
            get(report_expenses_by_category_csv),
        )
        .route("/inventory", get(list_products).post(create_product))
        .route("/inventory/adjust", post(adjust_inventory))
        .route(
            "/inventory/{product_id}",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route("/inventory/{product_id}/purchase", post(record_purchase))
        .route("/inventory/{product_id}/sell", post(record_sale))
        .route("/invoices", get(list_invoices).post(create_invoice))
        .route("/invoices/income/range", get(invoice_income_range))
        .route(
            "/invoices/{invoice_id}",
            get(get_invoice).delete(delete_invoice),
        )
        .route("/clients", get(list_clients).post(create_client))
        .route(
            "/clients/{client_id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route("/devices", get(list_devices).post(create_device))
        .route(
            "/devices/{device_id}",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/repairs", get(list_repairs).post(record_repair))
        .route("/dashboard/summary", get(dashboard_summary))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("taller gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(payload): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<TransactionView>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let entry_type = EntryType::parse(payload.entry_type.trim()).map_err(domain_error)?;
    let description = payload.description.trim().to_string();
    if description.is_empty() {
        return Err(invalid_request("description is required"));
    }
    if payload.amount <= Decimal::ZERO {
        return Err(invalid_request("amount must be greater than zero"));
    }
    let entry_date = match payload.date.as_deref() {
        Some(raw) => dates::parse_instant(raw, clock).map_err(domain_error)?,
        None => clock.now(),
    };

    let entry = LedgerEntry {
        id: Uuid::new_v4(),
        entry_date,
        entry_type,
        amount: payload.amount.round_dp(2),
        description,
        category: normalize_optional(payload.category),
        product_id: None,
        invoice_id: None,
        quantity: None,
        supplier: None,
        created_at: clock.now(),
    };

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    insert_ledger_entry(&mut tx, &entry).await.map_err(|err| {
        error!("failed to persist ledger entry: {err}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to persist ledger entry".to_string(),
        )
    })?;
    tx.commit().await.map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(transaction_view(entry, None))))
}

async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<TransactionListResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let from = match query.from.as_deref() {
        Some(raw) => Some(dates::parse_instant(raw, clock).map_err(domain_error)?),
        None => None,
    };
    let to = match query.to.as_deref() {
        Some(raw) => Some(dates::parse_instant(raw, clock).map_err(domain_error)?),
        None => None,
    };
    let entry_type = match query.entry_type.as_deref() {
        Some(raw) => Some(EntryType::parse(raw.trim()).map_err(domain_error)?),
        None => None,
    };
    let category = normalize_optional(query.category);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTION_LIMIT)
        .clamp(1, MAX_TRANSACTION_LIMIT);

    let rows = sqlx::query(
        r#"
        SELECT
            t.id,
            t.entry_date,
            t.entry_type,
            t.amount,
            t.description,
            t.category,
            t.product_id,
            p.name AS product_name,
            t.invoice_id,
            t.quantity,
            t.supplier,
            t.created_at
        FROM transactions t
        LEFT JOIN products p ON p.id = t.product_id
        WHERE ($1::timestamptz IS NULL OR t.entry_date >= $1)
          AND ($2::timestamptz IS NULL OR t.entry_date <= $2)
          AND ($3::text IS NULL OR t.entry_type = $3)
          AND ($4::text IS NULL OR t.category = $4)
        ORDER BY t.entry_date DESC, t.created_at DESC
        LIMIT $5
        "#,
    )
    .bind(from)
    .bind(to)
    .bind(entry_type.map(|entry_type| entry_type.as_str()))
    .bind(category)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        let entry = ledger_entry_from_row(row)?;
        let product_name = row
            .try_get::<Option<String>, _>("product_name")
            .map_err(internal_error)?;
        items.push(transaction_view(entry, product_name));
    }

    Ok(Json(TransactionListResponse { items }))
}

async fn delete_transaction(
    State(state): State<AppState>,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM transactions WHERE id = $1")
        .bind(transaction_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(domain_error(DomainError::NotFound("transaction")));
    }

    Ok(Json(MessageResponse {
        message: "transaction deleted".to_string(),
    }))
}

async fn daily_summary(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<DailySummaryView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let date = match query.date.as_deref() {
        Some(raw) => clock.local_date(dates::parse_instant(raw, clock).map_err(domain_error)?),
        None => clock.today(),
    };
    let (start, end) = dates::day_window(date, clock);
    let date_key = date.format("%Y-%m-%d").to_string();

    let rows = sqlx::query(
        r#"
        SELECT
            t.id,
            t.entry_date,
            t.entry_type,
            t.amount,
            t.description,
            t.category,
            t.product_id,
            p.name AS product_name,
            t.invoice_id,
            t.quantity,
            t.supplier,
            t.created_at
        FROM transactions t
        LEFT JOIN products p ON p.id = t.product_id
        WHERE t.entry_date >= $1 AND t.entry_date < $2
        ORDER BY t.entry_date DESC, t.created_at DESC
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(rows.len());
    let mut product_names = Vec::with_capacity(rows.len());
    for row in &rows {
        entries.push(ledger_entry_from_row(row)?);
        product_names.push(
            row.try_get::<Option<String>, _>("product_name")
                .map_err(internal_error)?,
        );
    }

    let opening_balance = sqlx::query_scalar::<_, Decimal>(
        "SELECT opening_balance FROM cash_sessions WHERE date_key = $1",
    )
    .bind(&date_key)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .unwrap_or(Decimal::ZERO);

    let totals = summary::daily_summary(&entries, opening_balance);
    let transactions = entries
        .into_iter()
        .zip(product_names)
        .map(|(entry, product_name)| transaction_view(entry, product_name))
        .collect();

    Ok(Json(DailySummaryView {
        date: date_key,
        income: totals.income,
        expense: totals.expense,
        net: totals.net,
        opening_balance: totals.opening_balance,
        closing_balance: totals.closing_balance,
        transactions,
    }))
}

async fn range_summary(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<RangeSummaryResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let (from, to) = dates::parse_range(query.from.as_deref(), query.to.as_deref(), clock)
        .map_err(domain_error)?;

    let rows = sqlx::query(
        r#"
        SELECT
            id, entry_date, entry_type, amount, description, category,
            product_id, invoice_id, quantity, supplier, created_at
        FROM transactions
        WHERE entry_date >= $1 AND entry_date <= $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        entries.push(ledger_entry_from_row(row)?);
    }

    Ok(Json(RangeSummaryResponse {
        from,
        to,
        days: summary::day_rows(&entries, clock),
    }))
}

async fn get_cash_session(
    State(state): State<AppState>,
    Query(query): Query<CashSessionQuery>,
) -> Result<Json<CashSessionView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let instant = match query.date.as_deref() {
        Some(raw) => dates::parse_instant(raw, clock).map_err(domain_error)?,
        None => clock.now(),
    };
    let date_key = dates::date_key(instant, clock);

    let row = sqlx::query(
        r#"
        SELECT id, date_key, opening_balance, notes, created_at, updated_at
        FROM cash_sessions
        WHERE date_key = $1
        "#,
    )
    .bind(&date_key)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let view = match row {
        Some(row) => {
            let session = cash_session_from_row(&row)?;
            CashSessionView {
                date: instant,
                date_key: session.date_key,
                opening_balance: session.opening_balance,
                notes: session.notes.unwrap_or_default(),
            }
        }
        None => CashSessionView {
            date: instant,
            date_key,
            opening_balance: Decimal::ZERO,
            notes: String::new(),
        },
    };

    Ok(Json(view))
}

async fn set_cash_session(
    State(state): State<AppState>,
    Json(payload): Json<SetCashSessionRequest>,
) -> Result<Json<CashSessionView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    if payload.opening_balance < Decimal::ZERO {
        return Err(invalid_request("openingBalance must not be negative"));
    }
    let opening_balance = payload.opening_balance.round_dp(2);

    let date = match (payload.date_key.as_deref(), payload.date.as_deref()) {
        (Some(raw), _) => dates::parse_date(raw).map_err(domain_error)?,
        (None, Some(raw)) => {
            clock.local_date(dates::parse_instant(raw, clock).map_err(domain_error)?)
        }
        (None, None) => clock.today(),
    };
    let date_key = date.format("%Y-%m-%d").to_string();
    let notes = normalize_optional(payload.notes);
    let now = clock.now();

    let row = sqlx::query(
        r#"
        INSERT INTO cash_sessions (id, date_key, opening_balance, notes, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (date_key) DO UPDATE SET
            opening_balance = EXCLUDED.opening_balance,
            notes = EXCLUDED.notes,
            updated_at = EXCLUDED.updated_at
        RETURNING id, date_key, opening_balance, notes, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&date_key)
    .bind(opening_balance)
    .bind(&notes)
    .bind(now)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let session = cash_session_from_row(&row)?;
    Ok(Json(CashSessionView {
        date: clock.local_midnight(date),
        date_key: session.date_key,
        opening_balance: session.opening_balance,
        notes: session.notes.unwrap_or_default(),
    }))
}

async fn report_summary_inner(
    state: &AppState,
    query: &ReportSummaryQuery,
) -> Result<ReportSummaryResponse, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let (from, to) = dates::parse_range(query.from.as_deref(), query.to.as_deref(), clock)
        .map_err(domain_error)?;
    let granularity = summary::Granularity::parse(query.granularity.as_deref());

    let invoice_rows = sqlx::query(
        "SELECT created_at, total FROM invoices WHERE created_at >= $1 AND created_at <= $2",
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut invoices = Vec::with_capacity(invoice_rows.len());
    for row in &invoice_rows {
        invoices.push(summary::InvoiceTotal {
            created_at: row.try_get("created_at").map_err(internal_error)?,
            total: row.try_get("total").map_err(internal_error)?,
        });
    }

    let entry_rows = sqlx::query(
        r#"
        SELECT id, entry_date, entry_type, amount, description, category,
               product_id, invoice_id, quantity, supplier, created_at
        FROM transactions
        WHERE entry_date >= $1 AND entry_date <= $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(entry_rows.len());
    for row in &entry_rows {
        entries.push(ledger_entry_from_row(row)?);
    }

    Ok(ReportSummaryResponse {
        from,
        to,
        granularity: granularity.as_str().to_string(),
        rows: summary::period_summary(&invoices, &entries, granularity, clock),
    })
}

async fn report_summary(
    State(state): State<AppState>,
    Query(query): Query<ReportSummaryQuery>,
) -> Result<Json<ReportSummaryResponse>, (StatusCode, String)> {
    let report = report_summary_inner(&state, &query).await?;
    Ok(Json(report))
}

async fn report_summary_csv(
    State(state): State<AppState>,
    Query(query): Query<ReportSummaryQuery>,
) -> Result<Response, (StatusCode, String)> {
    let report = report_summary_inner(&state, &query).await?;
    let mut rows = vec![vec![
        "bucket".to_string(),
        "income".to_string(),
        "expense".to_string(),
        "net".to_string(),
    ]];
    for row in &report.rows {
        rows.push(vec![
            row.bucket.clone(),
            row.income.to_string(),
            row.expense.to_string(),
            row.net.to_string(),
        ]);
    }
    Ok(csv_response("summary.csv", &rows))
}

async fn report_top_products_inner(
    state: &AppState,
    query: &TopProductsQuery,
) -> Result<TopProductsResponse, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let (from, to) = dates::parse_range(query.from.as_deref(), query.to.as_deref(), clock)
        .map_err(domain_error)?;
    let sort = breakdown::TopProductsSort::parse(query.sort_by.as_deref());
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TOP_PRODUCTS_LIMIT)
        .clamp(1, MAX_TOP_PRODUCTS_LIMIT) as usize;

    let item_rows = sqlx::query(
        r#"
        SELECT i.product_id, i.description, i.quantity, i.unit_price
        FROM invoice_items i
        JOIN invoices v ON v.id = i.invoice_id
        WHERE v.created_at >= $1 AND v.created_at <= $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(item_rows.len());
    for row in &item_rows {
        items.push(breakdown::ItemSale {
            product_id: row.try_get("product_id").map_err(internal_error)?,
            description: row.try_get("description").map_err(internal_error)?,
            quantity: row.try_get("quantity").map_err(internal_error)?,
            unit_price: row.try_get("unit_price").map_err(internal_error)?,
        });
    }

    let product_ids: Vec<Uuid> = items.iter().filter_map(|item| item.product_id).collect();
    let mut product_names = HashMap::new();
    if !product_ids.is_empty() {
        let name_rows = sqlx::query("SELECT id, name FROM products WHERE id = ANY($1)")
            .bind(&product_ids)
            .fetch_all(&state.pool)
            .await
            .map_err(internal_error)?;
        for row in &name_rows {
            product_names.insert(
                row.try_get::<Uuid, _>("id").map_err(internal_error)?,
                row.try_get::<String, _>("name").map_err(internal_error)?,
            );
        }
    }

    let rows = breakdown::top_products(&items, &product_names, sort, limit)
        .into_iter()
        .map(|sales| TopProductView {
            product_id: sales.product_id,
            name: sales.name,
            quantity: sales.quantity,
            value: sales.value,
        })
        .collect();

    Ok(TopProductsResponse {
        from,
        to,
        sort_by: sort.as_str().to_string(),
        rows,
    })
}

async fn report_top_products(
    State(state): State<AppState>,
    Query(query): Query<TopProductsQuery>,
) -> Result<Json<TopProductsResponse>, (StatusCode, String)> {
    let report = report_top_products_inner(&state, &query).await?;
    Ok(Json(report))
}

async fn report_top_products_csv(
    State(state): State<AppState>,
    Query(query): Query<TopProductsQuery>,
) -> Result<Response, (StatusCode, String)> {
    let report = report_top_products_inner(&state, &query).await?;
    let mut rows = vec![vec![
        "name".to_string(),
        "quantity".to_string(),
        "value".to_string(),
    ]];
    for row in &report.rows {
        rows.push(vec![
            row.name.clone(),
            row.quantity.to_string(),
            row.value.to_string(),
        ]);
    }
    Ok(csv_response("top-products.csv", &rows))
}

async fn report_expenses_by_category_inner(
    state: &AppState,
    query: &ExpensesByCategoryQuery,
) -> Result<ExpensesByCategoryResponse, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let (from, to) = dates::parse_range(query.from.as_deref(), query.to.as_deref(), clock)
        .map_err(domain_error)?;

    let rows = sqlx::query(
        r#"
        SELECT id, entry_date, entry_type, amount, description, category,
               product_id, invoice_id, quantity, supplier, created_at
        FROM transactions
        WHERE entry_type = 'expense' AND entry_date >= $1 AND entry_date <= $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in &rows {
        entries.push(ledger_entry_from_row(row)?);
    }
    let (rows, total) = breakdown::expenses_by_category(&entries);

    Ok(ExpensesByCategoryResponse {
        from,
        to,
        rows,
        total,
    })
}

async fn report_expenses_by_category(
    State(state): State<AppState>,
    Query(query): Query<ExpensesByCategoryQuery>,
) -> Result<Json<ExpensesByCategoryResponse>, (StatusCode, String)> {
    let report = report_expenses_by_category_inner(&state, &query).await?;
    Ok(Json(report))
}

async fn report_expenses_by_category_csv(
    State(state): State<AppState>,
    Query(query): Query<ExpensesByCategoryQuery>,
) -> Result<Response, (StatusCode, String)> {
    let report = report_expenses_by_category_inner(&state, &query).await?;
    let mut rows = vec![vec!["category".to_string(), "total".to_string()]];
    for row in &report.rows {
        rows.push(vec![row.category.clone(), row.total.to_string()]);
    }
    Ok(csv_response("expenses-by-category.csv", &rows))
}

async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ListProductsQuery>,
) -> Result<Json<ProductListResponse>, (StatusCode, String)> {
    let pattern = normalize_optional(query.q).map(|q| format!("%{q}%"));
    let category = normalize_optional(query.category);
    let limit = query.limit.unwrap_or(100).clamp(1, 500);

    let rows = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE ($1::text IS NULL OR name ILIKE $1 OR supplier ILIKE $1 OR barcode ILIKE $1)
          AND ($2::text IS NULL OR category = $2)
        ORDER BY name ASC
        LIMIT $3
        "#,
    )
    .bind(pattern)
    .bind(category)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(product_view(product_from_row(row)?));
    }
    Ok(Json(ProductListResponse { items }))
}

async fn create_product(
    State(state): State<AppState>,
    Json(payload): Json<CreateProductRequest>,
) -> Result<(StatusCode, Json<ProductView>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(invalid_request("name is required"));
    }
    let quantity = payload.quantity.unwrap_or(0);
    if quantity < 0 {
        return Err(invalid_request("quantity must not be negative"));
    }
    let price = payload.price.unwrap_or(Decimal::ZERO);
    if price < Decimal::ZERO {
        return Err(invalid_request("price must not be negative"));
    }
    let min_stock = payload.min_stock.unwrap_or(3);
    if min_stock < 0 {
        return Err(invalid_request("minStock must not be negative"));
    }
    let barcode = normalize_optional(payload.barcode);
    if let Some(code) = barcode.as_deref() {
        let existing =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM products WHERE barcode = $1")
                .bind(code)
                .fetch_one(&state.pool)
                .await
                .map_err(internal_error)?;
        if existing > 0 {
            return Err(domain_error(DomainError::Conflict(format!(
                "barcode {code} already registered"
            ))));
        }
    }

    let now = clock.now();
    let product = Product {
        id: Uuid::new_v4(),
        name,
        quantity,
        price: price.round_dp(2),
        supplier: normalize_optional(payload.supplier),
        barcode,
        category: normalize_optional(payload.category),
        min_stock,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO products (id, name, quantity, price, supplier, barcode, category,
                              min_stock, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(product.id)
    .bind(&product.name)
    .bind(product.quantity)
    .bind(product.price)
    .bind(&product.supplier)
    .bind(&product.barcode)
    .bind(&product.category)
    .bind(product.min_stock)
    .bind(product.created_at)
    .bind(product.updated_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(product_view(product))))
}

async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ProductView>, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE id = $1
        "#,
    )
    .bind(product_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("product")));
    };
    Ok(Json(product_view(product_from_row(&row)?)))
}

async fn update_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<UpdateProductRequest>,
) -> Result<Json<ProductView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let row = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE id = $1
        "#,
    )
    .bind(product_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("product")));
    };
    let mut product = product_from_row(&row)?;

    if let Some(name) = payload.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(invalid_request("name must not be empty"));
        }
        product.name = name;
    }
    if let Some(quantity) = payload.quantity {
        if quantity < 0 {
            return Err(invalid_request("quantity must not be negative"));
        }
        product.quantity = quantity;
    }
    if let Some(price) = payload.price {
        if price < Decimal::ZERO {
            return Err(invalid_request("price must not be negative"));
        }
        product.price = price.round_dp(2);
    }
    if let Some(min_stock) = payload.min_stock {
        if min_stock < 0 {
            return Err(invalid_request("minStock must not be negative"));
        }
        product.min_stock = min_stock;
    }
    if let Some(supplier) = payload.supplier {
        product.supplier = normalize_optional(Some(supplier));
    }
    if let Some(category) = payload.category {
        product.category = normalize_optional(Some(category));
    }
    if let Some(barcode) = payload.barcode {
        product.barcode = normalize_optional(Some(barcode));
    }
    if let Some(code) = product.barcode.as_deref() {
        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM products WHERE barcode = $1 AND id <> $2",
        )
        .bind(code)
        .bind(product.id)
        .fetch_one(&state.pool)
        .await
        .map_err(internal_error)?;
        if existing > 0 {
            return Err(domain_error(DomainError::Conflict(format!(
                "barcode {code} already registered"
            ))));
        }
    }
    product.updated_at = clock.now();

    sqlx::query(
        r#"
        UPDATE products
        SET name = $2, quantity = $3, price = $4, supplier = $5, barcode = $6,
            category = $7, min_stock = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(product.id)
    .bind(&product.name)
    .bind(product.quantity)
    .bind(product.price)
    .bind(&product.supplier)
    .bind(&product.barcode)
    .bind(&product.category)
    .bind(product.min_stock)
    .bind(product.updated_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(product_view(product)))
}

async fn delete_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM products WHERE id = $1")
        .bind(product_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(domain_error(DomainError::NotFound("product")));
    }

    Ok(Json(MessageResponse {
        message: "product deleted".to_string(),
    }))
}

async fn adjust_inventory(
    State(state): State<AppState>,
    Json(payload): Json<AdjustInventoryRequest>,
) -> Result<Json<AdjustInventoryResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    if payload.items.is_empty() {
        return Err(invalid_request("items must not be empty"));
    }
    for item in &payload.items {
        if item.quantity_used < 1 {
            return Err(invalid_request("quantityUsed must be at least 1"));
        }
    }

    let now = clock.now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let mut updated = 0_i64;
    let mut items = Vec::new();
    for item in &payload.items {
        let row = sqlx::query(
            r#"
            SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
                   created_at, updated_at
            FROM products
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(item.product_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?;
        let Some(row) = row else {
            continue;
        };
        let mut product = product_from_row(&row)?;
        product.quantity = (product.quantity - item.quantity_used).max(0);
        product.updated_at = now;
        sqlx::query("UPDATE products SET quantity = $2, updated_at = $3 WHERE id = $1")
            .bind(product.id)
            .bind(product.quantity)
            .bind(product.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        updated += 1;
        items.push(product_view(product));
    }
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(AdjustInventoryResponse { updated, items }))
}

async fn record_purchase(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<RecordPurchaseRequest>,
) -> Result<Json<StockMovementResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    if payload.quantity < 1 {
        return Err(invalid_request("quantity must be at least 1"));
    }
    if payload.unit_cost < Decimal::ZERO {
        return Err(invalid_request("unitCost must not be negative"));
    }

    let now = clock.now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("product")));
    };
    let mut product = product_from_row(&row)?;

    product.quantity += payload.quantity;
    product.updated_at = now;
    sqlx::query("UPDATE products SET quantity = $2, updated_at = $3 WHERE id = $1")
        .bind(product.id)
        .bind(product.quantity)
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    // A zero-cost intake moves stock without touching the books.
    let amount = (Decimal::from(payload.quantity) * payload.unit_cost).round_dp(2);
    let mut transaction = None;
    if amount > Decimal::ZERO {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_date: now,
            entry_type: EntryType::Expense,
            amount,
            description: normalize_optional(payload.notes)
                .unwrap_or_else(|| format!("purchase: {} x{}", product.name, payload.quantity)),
            category: Some(PURCHASE_CATEGORY.to_string()),
            product_id: Some(product.id),
            invoice_id: None,
            quantity: Some(payload.quantity),
            supplier: normalize_optional(payload.supplier).or_else(|| product.supplier.clone()),
            created_at: now,
        };
        insert_ledger_entry(&mut tx, &entry)
            .await
            .map_err(internal_error)?;
        transaction = Some(transaction_view(entry, Some(product.name.clone())));
    }
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(StockMovementResponse {
        product: product_view(product),
        transaction,
    }))
}

async fn record_sale(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Json(payload): Json<RecordSaleRequest>,
) -> Result<Json<StockMovementResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    if payload.quantity < 1 {
        return Err(invalid_request("quantity must be at least 1"));
    }
    if payload.unit_price < Decimal::ZERO {
        return Err(invalid_request("unitPrice must not be negative"));
    }

    let now = clock.now();
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(product_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("product")));
    };
    let mut product = product_from_row(&row)?;

    if product.quantity < payload.quantity {
        return Err(domain_error(DomainError::InsufficientStock {
            available: product.quantity,
            requested: payload.quantity,
        }));
    }
    product.quantity -= payload.quantity;
    product.updated_at = now;
    sqlx::query("UPDATE products SET quantity = $2, updated_at = $3 WHERE id = $1")
        .bind(product.id)
        .bind(product.quantity)
        .bind(product.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    let amount = (Decimal::from(payload.quantity) * payload.unit_price).round_dp(2);
    let mut transaction = None;
    if amount > Decimal::ZERO {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_date: now,
            entry_type: EntryType::Income,
            amount,
            description: normalize_optional(payload.notes)
                .unwrap_or_else(|| format!("sale: {} x{}", product.name, payload.quantity)),
            category: Some(SALE_CATEGORY.to_string()),
            product_id: Some(product.id),
            invoice_id: None,
            quantity: Some(payload.quantity),
            supplier: None,
            created_at: now,
        };
        insert_ledger_entry(&mut tx, &entry)
            .await
            .map_err(internal_error)?;
        transaction = Some(transaction_view(entry, Some(product.name.clone())));
    }
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(StockMovementResponse {
        product: product_view(product),
        transaction,
    }))
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<InvoiceListResponse>, (StatusCode, String)> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_INVOICE_LIMIT);
    let items = load_invoices(&state, limit).await?;
    Ok(Json(InvoiceListResponse { items }))
}

async fn create_invoice(
    State(state): State<AppState>,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceView>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    if payload.items.is_empty() {
        return Err(invalid_request("items must not be empty"));
    }
    let mut items = Vec::with_capacity(payload.items.len());
    for item in &payload.items {
        let description = item.description.trim().to_string();
        if description.is_empty() {
            return Err(invalid_request("item description is required"));
        }
        if item.quantity < 1 {
            return Err(invalid_request("item quantity must be at least 1"));
        }
        if item.unit_price < Decimal::ZERO {
            return Err(invalid_request("item unitPrice must not be negative"));
        }
        let unit_price = item.unit_price.round_dp(2);
        items.push(InvoiceItemView {
            product_id: item.product,
            description,
            quantity: item.quantity,
            unit_price,
            line_total: (Decimal::from(item.quantity) * unit_price).round_dp(2),
        });
    }
    let total: Decimal = items.iter().map(|item| item.line_total).sum();
    let created_at = match payload.date.as_deref() {
        Some(raw) => dates::parse_instant(raw, clock).map_err(domain_error)?,
        None => clock.now(),
    };
    let notes = normalize_optional(payload.notes);
    let invoice_id = Uuid::new_v4();
    let now = clock.now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let client_name =
        sqlx::query_scalar::<_, String>("SELECT name FROM clients WHERE id = $1")
            .bind(payload.client)
            .fetch_optional(&mut *tx)
            .await
            .map_err(internal_error)?;
    let Some(client_name) = client_name else {
        return Err(domain_error(DomainError::NotFound("client")));
    };

    let mut device_label = None;
    if let Some(device_id) = payload.device {
        let device = sqlx::query("SELECT brand, model FROM devices WHERE id = $1")
            .bind(device_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(internal_error)?;
        let Some(device) = device else {
            return Err(domain_error(DomainError::NotFound("device")));
        };
        let brand: String = device.try_get("brand").map_err(internal_error)?;
        let model: String = device.try_get("model").map_err(internal_error)?;
        device_label = Some(format!("{brand} {model}"));
    }

    sqlx::query(
        r#"
        INSERT INTO invoices (id, client_id, device_id, total, notes, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(invoice_id)
    .bind(payload.client)
    .bind(payload.device)
    .bind(total)
    .bind(&notes)
    .bind(created_at)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    for (position, item) in items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO invoice_items (id, invoice_id, position, product_id, description,
                                       quantity, unit_price)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(invoice_id)
        .bind(position as i32)
        .bind(item.product_id)
        .bind(&item.description)
        .bind(item.quantity)
        .bind(item.unit_price)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

        if let Some(product_id) = item.product_id {
            sqlx::query(
                r#"
                UPDATE products
                SET quantity = GREATEST(quantity - $2, 0), updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(product_id)
            .bind(item.quantity)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;
        }
    }

    tx.commit().await.map_err(internal_error)?;

    // The invoice is the record of truth; the ledger mirror is best effort
    // and a failure here must not undo the committed invoice.
    if let Err(err) = mirror_invoice_income(&state, invoice_id, created_at, &items).await {
        error!("failed to mirror invoice {invoice_id} into the ledger: {err}");
    }

    Ok((
        StatusCode::CREATED,
        Json(InvoiceView {
            id: invoice_id,
            client_id: payload.client,
            client_name: Some(client_name),
            device_id: payload.device,
            device_label,
            total,
            notes,
            items,
            created_at,
        }),
    ))
}

async fn mirror_invoice_income(
    state: &AppState,
    invoice_id: Uuid,
    entry_date: DateTime<Utc>,
    items: &[InvoiceItemView],
) -> AnyResult<()> {
    let now = state.clock.now();
    let mut tx = state.pool.begin().await?;
    for item in items {
        if item.line_total <= Decimal::ZERO {
            continue;
        }
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_date,
            entry_type: EntryType::Income,
            amount: item.line_total,
            description: item.description.clone(),
            category: Some(SALE_CATEGORY.to_string()),
            product_id: item.product_id,
            invoice_id: Some(invoice_id),
            quantity: Some(item.quantity),
            supplier: None,
            created_at: now,
        };
        insert_ledger_entry(&mut tx, &entry).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceView>, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT
            v.id, v.client_id, c.name AS client_name, v.device_id,
            d.brand AS device_brand, d.model AS device_model,
            v.total, v.notes, v.created_at
        FROM invoices v
        LEFT JOIN clients c ON c.id = v.client_id
        LEFT JOIN devices d ON d.id = v.device_id
        WHERE v.id = $1
        "#,
    )
    .bind(invoice_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("invoice")));
    };
    let mut view = invoice_view_from_row(&row)?;

    let item_rows = sqlx::query(
        r#"
        SELECT invoice_id, product_id, description, quantity, unit_price
        FROM invoice_items
        WHERE invoice_id = $1
        ORDER BY position
        "#,
    )
    .bind(invoice_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;
    for row in &item_rows {
        view.items.push(invoice_item_from_row(row)?);
    }

    Ok(Json(view))
}

async fn delete_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    // Ledger entries mirrored from this invoice stay on the books.
    let result = sqlx::query("DELETE FROM invoices WHERE id = $1")
        .bind(invoice_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(domain_error(DomainError::NotFound("invoice")));
    }

    Ok(Json(MessageResponse {
        message: "invoice deleted".to_string(),
    }))
}

async fn invoice_income_range(
    State(state): State<AppState>,
    Query(query): Query<InvoiceIncomeQuery>,
) -> Result<Json<InvoiceIncomeResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let (from, to) = dates::parse_range(query.from.as_deref(), query.to.as_deref(), clock)
        .map_err(domain_error)?;

    let row = sqlx::query(
        r#"
        SELECT COALESCE(SUM(total), 0) AS total, COUNT(*) AS count
        FROM invoices
        WHERE created_at >= $1 AND created_at <= $2
        "#,
    )
    .bind(from)
    .bind(to)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(InvoiceIncomeResponse {
        from,
        to,
        total: row.try_get("total").map_err(internal_error)?,
        count: row.try_get("count").map_err(internal_error)?,
    }))
}

async fn list_clients(
    State(state): State<AppState>,
) -> Result<Json<ClientListResponse>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, phone, email, created_at, updated_at
        FROM clients
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(client_view_from_row(row)?);
    }
    Ok(Json(ClientListResponse { items }))
}

async fn create_client(
    State(state): State<AppState>,
    Json(payload): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<ClientView>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let name = payload.name.trim().to_string();
    if name.is_empty() {
        return Err(invalid_request("name is required"));
    }
    let phone = payload.phone.trim().to_string();
    if phone.is_empty() {
        return Err(invalid_request("phone is required"));
    }
    let email = normalize_optional(payload.email).map(|email| email.to_lowercase());

    let now = clock.now();
    let view = ClientView {
        id: Uuid::new_v4(),
        name,
        phone,
        email,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO clients (id, name, phone, email, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(view.id)
    .bind(&view.name)
    .bind(&view.phone)
    .bind(&view.email)
    .bind(view.created_at)
    .bind(view.updated_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<ClientDetailView>, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT id, name, phone, email, created_at, updated_at
        FROM clients
        WHERE id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("client")));
    };
    let client = client_view_from_row(&row)?;

    let device_rows = sqlx::query(
        r#"
        SELECT
            d.id, d.client_id, c.name AS client_name, d.brand, d.model, d.issue,
            d.status, d.received_at, d.delivered_at, d.created_at, d.updated_at
        FROM devices d
        LEFT JOIN clients c ON c.id = d.client_id
        WHERE d.client_id = $1
        ORDER BY d.created_at DESC
        "#,
    )
    .bind(client_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut devices = Vec::with_capacity(device_rows.len());
    for row in &device_rows {
        devices.push(device_view_from_row(row)?);
    }

    Ok(Json(ClientDetailView {
        id: client.id,
        name: client.name,
        phone: client.phone,
        email: client.email,
        created_at: client.created_at,
        updated_at: client.updated_at,
        devices,
    }))
}

async fn update_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
    Json(payload): Json<UpdateClientRequest>,
) -> Result<Json<ClientView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let row = sqlx::query(
        r#"
        SELECT id, name, phone, email, created_at, updated_at
        FROM clients
        WHERE id = $1
        "#,
    )
    .bind(client_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("client")));
    };
    let mut client = client_view_from_row(&row)?;

    if let Some(name) = payload.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(invalid_request("name must not be empty"));
        }
        client.name = name;
    }
    if let Some(phone) = payload.phone {
        let phone = phone.trim().to_string();
        if phone.is_empty() {
            return Err(invalid_request("phone must not be empty"));
        }
        client.phone = phone;
    }
    if let Some(email) = payload.email {
        client.email = normalize_optional(Some(email)).map(|email| email.to_lowercase());
    }
    client.updated_at = clock.now();

    sqlx::query(
        r#"
        UPDATE clients
        SET name = $2, phone = $3, email = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(client.id)
    .bind(&client.name)
    .bind(&client.phone)
    .bind(&client.email)
    .bind(client.updated_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(client))
}

async fn delete_client(
    State(state): State<AppState>,
    Path(client_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM clients WHERE id = $1")
        .bind(client_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(domain_error(DomainError::NotFound("client")));
    }

    Ok(Json(MessageResponse {
        message: "client deleted".to_string(),
    }))
}

async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<ListDevicesQuery>,
) -> Result<Json<DeviceListResponse>, (StatusCode, String)> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(DeviceStatus::parse(raw.trim()).map_err(domain_error)?),
        None => None,
    };

    let rows = sqlx::query(
        r#"
        SELECT
            d.id, d.client_id, c.name AS client_name, d.brand, d.model, d.issue,
            d.status, d.received_at, d.delivered_at, d.created_at, d.updated_at
        FROM devices d
        LEFT JOIN clients c ON c.id = d.client_id
        WHERE ($1::text IS NULL OR d.status = $1)
          AND ($2::uuid IS NULL OR d.client_id = $2)
        ORDER BY d.created_at DESC
        "#,
    )
    .bind(status.map(|status| status.as_str()))
    .bind(query.client)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(device_view_from_row(row)?);
    }
    Ok(Json(DeviceListResponse { items }))
}

async fn create_device(
    State(state): State<AppState>,
    Json(payload): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<DeviceView>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let brand = payload.brand.trim().to_string();
    if brand.is_empty() {
        return Err(invalid_request("brand is required"));
    }
    let model = payload.model.trim().to_string();
    if model.is_empty() {
        return Err(invalid_request("model is required"));
    }
    let issue = payload.issue.trim().to_string();
    if issue.is_empty() {
        return Err(invalid_request("issue is required"));
    }

    let client_name =
        sqlx::query_scalar::<_, String>("SELECT name FROM clients WHERE id = $1")
            .bind(payload.client)
            .fetch_optional(&state.pool)
            .await
            .map_err(internal_error)?;
    let Some(client_name) = client_name else {
        return Err(domain_error(DomainError::NotFound("client")));
    };

    let now = clock.now();
    let device_id = Uuid::new_v4();
    let status = DeviceStatus::default();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    sqlx::query(
        r#"
        INSERT INTO devices (id, client_id, brand, model, issue, status, received_at,
                             delivered_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NULL, $8, $8)
        "#,
    )
    .bind(device_id)
    .bind(payload.client)
    .bind(&brand)
    .bind(&model)
    .bind(&issue)
    .bind(status.as_str())
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    sqlx::query(
        r#"
        INSERT INTO repair_events (id, device_id, status, comment, at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(device_id)
    .bind(status.as_str())
    .bind("intake")
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(DeviceView {
            id: device_id,
            client_id: payload.client,
            client_name: Some(client_name),
            brand,
            model,
            issue,
            status,
            received_at: now,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }),
    ))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<DeviceDetailView>, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT
            d.id, d.client_id, c.name AS client_name, d.brand, d.model, d.issue,
            d.status, d.received_at, d.delivered_at, d.created_at, d.updated_at
        FROM devices d
        LEFT JOIN clients c ON c.id = d.client_id
        WHERE d.id = $1
        "#,
    )
    .bind(device_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("device")));
    };
    let device = device_view_from_row(&row)?;

    let event_rows = sqlx::query(
        r#"
        SELECT id, device_id, status, comment, at
        FROM repair_events
        WHERE device_id = $1
        ORDER BY at DESC
        "#,
    )
    .bind(device_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut history = Vec::with_capacity(event_rows.len());
    for row in &event_rows {
        history.push(repair_event_from_row(row)?);
    }

    Ok(Json(DeviceDetailView {
        id: device.id,
        client_id: device.client_id,
        client_name: device.client_name,
        brand: device.brand,
        model: device.model,
        issue: device.issue,
        status: device.status,
        received_at: device.received_at,
        delivered_at: device.delivered_at,
        created_at: device.created_at,
        updated_at: device.updated_at,
        history,
    }))
}

async fn update_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    Json(payload): Json<UpdateDeviceRequest>,
) -> Result<Json<DeviceView>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let row = sqlx::query(
        r#"
        SELECT
            d.id, d.client_id, c.name AS client_name, d.brand, d.model, d.issue,
            d.status, d.received_at, d.delivered_at, d.created_at, d.updated_at
        FROM devices d
        LEFT JOIN clients c ON c.id = d.client_id
        WHERE d.id = $1
        "#,
    )
    .bind(device_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("device")));
    };
    let mut device = device_view_from_row(&row)?;

    if let Some(brand) = payload.brand {
        let brand = brand.trim().to_string();
        if brand.is_empty() {
            return Err(invalid_request("brand must not be empty"));
        }
        device.brand = brand;
    }
    if let Some(model) = payload.model {
        let model = model.trim().to_string();
        if model.is_empty() {
            return Err(invalid_request("model must not be empty"));
        }
        device.model = model;
    }
    if let Some(issue) = payload.issue {
        let issue = issue.trim().to_string();
        if issue.is_empty() {
            return Err(invalid_request("issue must not be empty"));
        }
        device.issue = issue;
    }
    device.updated_at = clock.now();

    sqlx::query(
        r#"
        UPDATE devices
        SET brand = $2, model = $3, issue = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(device.id)
    .bind(&device.brand)
    .bind(&device.model)
    .bind(&device.issue)
    .bind(device.updated_at)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(device))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, (StatusCode, String)> {
    // Repair history goes with the device through the cascade.
    let result = sqlx::query("DELETE FROM devices WHERE id = $1")
        .bind(device_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err(domain_error(DomainError::NotFound("device")));
    }

    Ok(Json(MessageResponse {
        message: "device deleted".to_string(),
    }))
}

async fn list_repairs(
    State(state): State<AppState>,
    Query(query): Query<ListRepairsQuery>,
) -> Result<Json<RepairListResponse>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT id, device_id, status, comment, at
        FROM repair_events
        WHERE ($1::uuid IS NULL OR device_id = $1)
        ORDER BY at DESC
        "#,
    )
    .bind(query.device)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in &rows {
        items.push(repair_event_from_row(row)?);
    }
    Ok(Json(RepairListResponse { items }))
}

async fn record_repair(
    State(state): State<AppState>,
    Json(payload): Json<RecordRepairRequest>,
) -> Result<(StatusCode, Json<RepairUpdateResponse>), (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let status = DeviceStatus::parse(payload.status.trim()).map_err(domain_error)?;
    let comment = normalize_optional(payload.comment);
    let now = clock.now();

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let row = sqlx::query(
        r#"
        SELECT id, client_id, brand, model, issue, status, received_at, delivered_at,
               created_at, updated_at
        FROM devices
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(payload.device)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;
    let Some(row) = row else {
        return Err(domain_error(DomainError::NotFound("device")));
    };

    let delivered_at = if status == DeviceStatus::Delivered {
        Some(now)
    } else {
        row.try_get::<Option<DateTime<Utc>>, _>("delivered_at")
            .map_err(internal_error)?
    };

    sqlx::query(
        r#"
        UPDATE devices
        SET status = $2, delivered_at = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(payload.device)
    .bind(status.as_str())
    .bind(delivered_at)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    let event = RepairEventView {
        id: Uuid::new_v4(),
        device_id: payload.device,
        status,
        comment: comment.clone(),
        at: now,
    };
    sqlx::query(
        r#"
        INSERT INTO repair_events (id, device_id, status, comment, at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.id)
    .bind(event.device_id)
    .bind(status.as_str())
    .bind(&comment)
    .bind(event.at)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    let client_id: Uuid = row.try_get("client_id").map_err(internal_error)?;
    let client_name =
        sqlx::query_scalar::<_, String>("SELECT name FROM clients WHERE id = $1")
            .bind(client_id)
            .fetch_optional(&state.pool)
            .await
            .map_err(internal_error)?;

    let device = DeviceView {
        id: payload.device,
        client_id,
        client_name,
        brand: row.try_get("brand").map_err(internal_error)?,
        model: row.try_get("model").map_err(internal_error)?,
        issue: row.try_get("issue").map_err(internal_error)?,
        status,
        received_at: row.try_get("received_at").map_err(internal_error)?,
        delivered_at,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: now,
    };

    Ok((
        StatusCode::CREATED,
        Json(RepairUpdateResponse { device, event }),
    ))
}

async fn dashboard_summary(
    State(state): State<AppState>,
) -> Result<Json<DashboardSummaryResponse>, (StatusCode, String)> {
    let clock = state.clock.as_ref();
    let active_repairs = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM devices WHERE status <> 'delivered'",
    )
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let since = clock.now() - Duration::days(30);
    let income_last30_days = sqlx::query_scalar::<_, Decimal>(
        "SELECT COALESCE(SUM(total), 0) FROM invoices WHERE created_at >= $1",
    )
    .bind(since)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let recent_invoices = load_invoices(&state, 10).await?;

    let low_rows = sqlx::query(
        r#"
        SELECT id, name, quantity, price, supplier, barcode, category, min_stock,
               created_at, updated_at
        FROM products
        WHERE quantity < min_stock
        ORDER BY quantity ASC
        LIMIT 20
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut low_inventory = Vec::with_capacity(low_rows.len());
    for row in &low_rows {
        low_inventory.push(product_view(product_from_row(row)?));
    }

    Ok(Json(DashboardSummaryResponse {
        active_repairs,
        income_last30_days,
        recent_invoices,
        low_inventory,
    }))
}

async fn load_invoices(
    state: &AppState,
    limit: i64,
) -> Result<Vec<InvoiceView>, (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT
            v.id, v.client_id, c.name AS client_name, v.device_id,
            d.brand AS device_brand, d.model AS device_model,
            v.total, v.notes, v.created_at
        FROM invoices v
        LEFT JOIN clients c ON c.id = v.client_id
        LEFT JOIN devices d ON d.id = v.device_id
        ORDER BY v.created_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut views = Vec::with_capacity(rows.len());
    let mut ids = Vec::with_capacity(rows.len());
    for row in &rows {
        let view = invoice_view_from_row(row)?;
        ids.push(view.id);
        views.push(view);
    }

    if !ids.is_empty() {
        let item_rows = sqlx::query(
            r#"
            SELECT invoice_id, product_id, description, quantity, unit_price
            FROM invoice_items
            WHERE invoice_id = ANY($1)
            ORDER BY invoice_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

        let mut by_invoice: HashMap<Uuid, Vec<InvoiceItemView>> = HashMap::new();
        for row in &item_rows {
            let invoice_id: Uuid = row.try_get("invoice_id").map_err(internal_error)?;
            by_invoice
                .entry(invoice_id)
                .or_default()
                .push(invoice_item_from_row(row)?);
        }
        for view in &mut views {
            if let Some(items) = by_invoice.remove(&view.id) {
                view.items = items;
            }
        }
    }

    Ok(views)
}

fn ledger_entry_from_row(row: &PgRow) -> Result<LedgerEntry, (StatusCode, String)> {
    let raw_type: String = row.try_get("entry_type").map_err(internal_error)?;
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(internal_error)?,
        entry_date: row.try_get("entry_date").map_err(internal_error)?,
        entry_type: EntryType::parse(&raw_type).map_err(internal_error)?,
        amount: row.try_get("amount").map_err(internal_error)?,
        description: row.try_get("description").map_err(internal_error)?,
        category: row.try_get("category").map_err(internal_error)?,
        product_id: row.try_get("product_id").map_err(internal_error)?,
        invoice_id: row.try_get("invoice_id").map_err(internal_error)?,
        quantity: row.try_get("quantity").map_err(internal_error)?,
        supplier: row.try_get("supplier").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
    })
}

fn transaction_view(entry: LedgerEntry, product_name: Option<String>) -> TransactionView {
    TransactionView {
        id: entry.id,
        date: entry.entry_date,
        entry_type: entry.entry_type,
        amount: entry.amount,
        description: entry.description,
        category: entry.category,
        product_id: entry.product_id,
        product_name,
        invoice_id: entry.invoice_id,
        quantity: entry.quantity,
        supplier: entry.supplier,
        created_at: entry.created_at,
    }
}

async fn insert_ledger_entry(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    entry: &LedgerEntry,
) -> AnyResult<()> {
    sqlx::query(
        r#"
        INSERT INTO transactions (id, entry_date, entry_type, amount, description, category,
                                  product_id, invoice_id, quantity, supplier, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(entry.id)
    .bind(entry.entry_date)
    .bind(entry.entry_type.as_str())
    .bind(entry.amount)
    .bind(&entry.description)
    .bind(&entry.category)
    .bind(entry.product_id)
    .bind(entry.invoice_id)
    .bind(entry.quantity)
    .bind(&entry.supplier)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn product_from_row(row: &PgRow) -> Result<Product, (StatusCode, String)> {
    Ok(Product {
        id: row.try_get("id").map_err(internal_error)?,
        name: row.try_get("name").map_err(internal_error)?,
        quantity: row.try_get("quantity").map_err(internal_error)?,
        price: row.try_get("price").map_err(internal_error)?,
        supplier: row.try_get("supplier").map_err(internal_error)?,
        barcode: row.try_get("barcode").map_err(internal_error)?,
        category: row.try_get("category").map_err(internal_error)?,
        min_stock: row.try_get("min_stock").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

fn product_view(product: Product) -> ProductView {
    ProductView {
        id: product.id,
        name: product.name,
        quantity: product.quantity,
        price: product.price,
        supplier: product.supplier,
        barcode: product.barcode,
        category: product.category,
        min_stock: product.min_stock,
        created_at: product.created_at,
        updated_at: product.updated_at,
    }
}

fn cash_session_from_row(row: &PgRow) -> Result<CashSession, (StatusCode, String)> {
    Ok(CashSession {
        id: row.try_get("id").map_err(internal_error)?,
        date_key: row.try_get("date_key").map_err(internal_error)?,
        opening_balance: row.try_get("opening_balance").map_err(internal_error)?,
        notes: row.try_get("notes").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

fn client_view_from_row(row: &PgRow) -> Result<ClientView, (StatusCode, String)> {
    Ok(ClientView {
        id: row.try_get("id").map_err(internal_error)?,
        name: row.try_get("name").map_err(internal_error)?,
        phone: row.try_get("phone").map_err(internal_error)?,
        email: row.try_get("email").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

fn device_view_from_row(row: &PgRow) -> Result<DeviceView, (StatusCode, String)> {
    let raw_status: String = row.try_get("status").map_err(internal_error)?;
    Ok(DeviceView {
        id: row.try_get("id").map_err(internal_error)?,
        client_id: row.try_get("client_id").map_err(internal_error)?,
        client_name: row.try_get("client_name").map_err(internal_error)?,
        brand: row.try_get("brand").map_err(internal_error)?,
        model: row.try_get("model").map_err(internal_error)?,
        issue: row.try_get("issue").map_err(internal_error)?,
        status: DeviceStatus::parse(&raw_status).map_err(internal_error)?,
        received_at: row.try_get("received_at").map_err(internal_error)?,
        delivered_at: row.try_get("delivered_at").map_err(internal_error)?,
        created_at: row.try_get("created_at").map_err(internal_error)?,
        updated_at: row.try_get("updated_at").map_err(internal_error)?,
    })
}

fn repair_event_from_row(row: &PgRow) -> Result<RepairEventView, (StatusCode, String)> {
    let raw_status: String = row.try_get("status").map_err(internal_error)?;
    Ok(RepairEventView {
        id: row.try_get("id").map_err(internal_error)?,
        device_id: row.try_get("device_id").map_err(internal_error)?,
        status: DeviceStatus::parse(&raw_status).map_err(internal_error)?,
        comment: row.try_get("comment").map_err(internal_error)?,
        at: row.try_get("at").map_err(internal_error)?,
    })
}

fn invoice_view_from_row(row: &PgRow) -> Result<InvoiceView, (StatusCode, String)> {
    let brand: Option<String> = row.try_get("device_brand").map_err(internal_error)?;
    let model: Option<String> = row.try_get("device_model").map_err(internal_error)?;
    let device_label = match (brand, model) {
        (Some(brand), Some(model)) => Some(format!("{brand} {model}")),
        _ => None,
    };
    Ok(InvoiceView {
        id: row.try_get("id").map_err(internal_error)?,
        client_id: row.try_get("client_id").map_err(internal_error)?,
        client_name: row.try_get("client_name").map_err(internal_error)?,
        device_id: row.try_get("device_id").map_err(internal_error)?,
        device_label,
        total: row.try_get("total").map_err(internal_error)?,
        notes: row.try_get("notes").map_err(internal_error)?,
        items: Vec::new(),
        created_at: row.try_get("created_at").map_err(internal_error)?,
    })
}

fn invoice_item_from_row(row: &PgRow) -> Result<InvoiceItemView, (StatusCode, String)> {
    let quantity: i32 = row.try_get("quantity").map_err(internal_error)?;
    let unit_price: Decimal = row.try_get("unit_price").map_err(internal_error)?;
    Ok(InvoiceItemView {
        product_id: row.try_get("product_id").map_err(internal_error)?,
        description: row.try_get("description").map_err(internal_error)?,
        quantity,
        unit_price,
        line_total: (Decimal::from(quantity) * unit_price).round_dp(2),
    })
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    let value = value?.trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

fn csv_field(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn csv_document(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|field| csv_field(field))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn csv_response(filename: &str, rows: &[Vec<String>]) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        csv_document(rows),
    )
        .into_response()
}

fn domain_error(err: DomainError) -> (StatusCode, String) {
    let status = match err {
        DomainError::Validation(_) => StatusCode::BAD_REQUEST,
        DomainError::NotFound(_) => StatusCode::NOT_FOUND,
        DomainError::InsufficientStock { .. } => StatusCode::CONFLICT,
        DomainError::Conflict(_) => StatusCode::CONFLICT,
    };
    (status, err.to_string())
}

fn invalid_request(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_are_quoted_and_escaped() {
        assert_eq!(csv_field("plain"), "\"plain\"");
        assert_eq!(csv_field("he said \"hi\""), "\"he said \"\"hi\"\"\"");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
    }

    #[test]
    fn csv_documents_join_rows_with_newlines() {
        let rows = vec![
            vec!["bucket".to_string(), "income".to_string()],
            vec!["2024-03".to_string(), "150".to_string()],
        ];
        assert_eq!(
            csv_document(&rows),
            "\"bucket\",\"income\"\n\"2024-03\",\"150\""
        );
    }

    #[test]
    fn blank_optionals_collapse_to_none() {
        assert_eq!(
            normalize_optional(Some("  acme  ".to_string())),
            Some("acme".to_string())
        );
        assert_eq!(normalize_optional(Some("   ".to_string())), None);
        assert_eq!(normalize_optional(None), None);
    }

    #[test]
    fn domain_errors_map_to_their_statuses() {
        let (status, _) = domain_error(DomainError::Validation("bad".to_string()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, message) = domain_error(DomainError::NotFound("invoice"));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message, "invoice not found");
        let (status, message) = domain_error(DomainError::InsufficientStock {
            available: 1,
            requested: 3,
        });
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(message, "insufficient stock: 1 available, 3 requested");
    }

    #[test]
    fn transaction_views_serialize_in_wire_case() {
        let entry = LedgerEntry {
            id: Uuid::nil(),
            entry_date: DateTime::<Utc>::UNIX_EPOCH,
            entry_type: EntryType::Income,
            amount: Decimal::new(1050, 2),
            description: "screen swap".to_string(),
            category: Some("sale".to_string()),
            product_id: None,
            invoice_id: None,
            quantity: Some(1),
            supplier: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        let json =
            serde_json::to_value(transaction_view(entry, Some("Screen".to_string()))).unwrap();
        assert_eq!(json["type"], "income");
        assert_eq!(json["amount"], "10.50");
        assert_eq!(json["productName"], "Screen");
        assert!(json.get("entry_type").is_none());
    }
}
