//! Worksheet access and row extraction: tab discovery by title variant,
//! header-synonym lookup, per-field cleaners and the retrying REST client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use ctv_core::{canonical_phone, normalize_label, NewVisit, SourceTag};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const CRATE_NAME: &str = "ctv-sheets";

/// Status stored when the sheet leaves the cell blank. Never normalizes to
/// the completed status, so defaulted rows earn no commission.
pub const DEFAULT_STATUS: &str = "chưa đến";

const PHONE_WIDTH: usize = 15;
const NAME_WIDTH: usize = 100;
const SERVICE_WIDTH: usize = 500;
const NOTE_WIDTH: usize = 500;
const SHORT_WIDTH: usize = 100;
const TIME_WIDTH: usize = 20;
const STATUS_WIDTH: usize = 50;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("sheet request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sheet api returned status {status} for {context}")]
    Http { status: u16, context: String },
    #[error("no worksheet matches any title variant for {tag}")]
    TabNotFound { tag: &'static str },
    #[error("sheet auth: {0}")]
    Auth(String),
    #[error("unexpected sheet payload: {0}")]
    Payload(String),
}

impl SheetError {
    /// Transient failures (429/5xx, connect/timeout) are worth retrying
    /// inside a cycle; everything else waits for the next cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            SheetError::Transport(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            SheetError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Exponential backoff for sheet reads: base 5 s, factor 3, three attempts.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            factor: 3,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = self.factor.saturating_pow(attempt_index as u32);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The spreadsheet as the rest of the system sees it: a matrix of strings
/// per worksheet plus row append. Implementations own their retry policy.
#[async_trait]
pub trait SheetClient: Send + Sync {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetError>;
    async fn read_matrix(&self, title: &str) -> Result<Vec<Vec<String>>, SheetError>;
    async fn append_row(&self, title: &str, row: &[String]) -> Result<(), SheetError>;
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub sheet_id: String,
    pub access_token: Option<String>,
    pub token_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl SheetsConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let sheet_id = std::env::var("GOOGLE_SHEET_ID")
            .map_err(|_| anyhow::anyhow!("GOOGLE_SHEET_ID is not set"))?;
        Ok(Self {
            sheet_id,
            access_token: std::env::var("GOOGLE_ACCESS_TOKEN").ok(),
            token_url: std::env::var("GOOGLE_TOKEN_URL").ok(),
            http_timeout_secs: std::env::var("SHEETS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Google Sheets v4 values API over reqwest. Credential signing stays out of
/// scope: the bearer token comes from the environment or a token endpoint
/// (workload identity style) and is cached until shortly before expiry.
pub struct RestSheetClient {
    client: reqwest::Client,
    config: SheetsConfig,
    backoff: BackoffPolicy,
    token: Mutex<Option<(String, Instant)>>,
}

impl RestSheetClient {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            backoff: BackoffPolicy::default(),
            token: Mutex::new(None),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    async fn bearer_token(&self) -> Result<String, SheetError> {
        if let Some(token) = &self.config.access_token {
            return Ok(token.clone());
        }
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(token.clone());
            }
        }
        let url = self
            .config
            .token_url
            .as_deref()
            .ok_or_else(|| SheetError::Auth("neither GOOGLE_ACCESS_TOKEN nor GOOGLE_TOKEN_URL is set".into()))?;
        let resp = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SheetError::Auth(format!("token endpoint returned {}", resp.status())));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SheetError::Auth(format!("token payload: {e}")))?;
        let ttl = token.expires_in.unwrap_or(300).saturating_sub(30);
        *cached = Some((token.access_token.clone(), Instant::now() + Duration::from_secs(ttl)));
        Ok(token.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SheetError> {
        let mut last_err: Option<SheetError> = None;
        for attempt in 0..=self.backoff.max_retries {
            let token = self.bearer_token().await?;
            let result = self.client.get(url).bearer_auth(token).send().await;
            let err = match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| SheetError::Payload(e.to_string()));
                }
                Ok(resp) => SheetError::Http {
                    status: resp.status().as_u16(),
                    context: url.to_string(),
                },
                Err(e) => SheetError::Transport(e),
            };
            if err.is_transient() && attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(url, attempt, ?delay, error = %err, "transient sheet failure, backing off");
                tokio::time::sleep(delay).await;
                last_err = Some(err);
                continue;
            }
            return Err(err);
        }
        Err(last_err.expect("retry loop captures an error before exhausting attempts"))
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values/{}",
            self.config.sheet_id,
            urlencode(range)
        )
    }
}

#[async_trait]
impl SheetClient for RestSheetClient {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetError> {
        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}?fields=sheets.properties.title",
            self.config.sheet_id
        );
        let meta: SpreadsheetMeta = self.get_json(&url).await?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn read_matrix(&self, title: &str) -> Result<Vec<Vec<String>>, SheetError> {
        let resp: ValuesResponse = self.get_json(&self.values_url(title)).await?;
        Ok(resp.values)
    }

    async fn append_row(&self, title: &str, row: &[String]) -> Result<(), SheetError> {
        let url = format!("{}:append?valueInputOption=USER_ENTERED", self.values_url(title));
        let token = self.bearer_token().await?;
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "values": [row] }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SheetError::Http {
                status: resp.status().as_u16(),
                context: url,
            });
        }
        Ok(())
    }
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// In-process spreadsheet used by tests and offline runs. `fail_reads`
/// injects transient failures per tab to exercise fault isolation.
#[derive(Default)]
pub struct MemorySheetClient {
    tabs: Mutex<HashMap<String, Vec<Vec<String>>>>,
    fail_reads: Mutex<HashMap<String, usize>>,
}

impl MemorySheetClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_tab(&self, title: &str, matrix: Vec<Vec<String>>) {
        self.tabs.lock().await.insert(title.to_string(), matrix);
    }

    pub async fn push_row(&self, title: &str, row: Vec<String>) {
        self.tabs.lock().await.entry(title.to_string()).or_default().push(row);
    }

    pub async fn fail_next_reads(&self, title: &str, count: usize) {
        self.fail_reads.lock().await.insert(title.to_string(), count);
    }
}

#[async_trait]
impl SheetClient for MemorySheetClient {
    async fn worksheet_titles(&self) -> Result<Vec<String>, SheetError> {
        Ok(self.tabs.lock().await.keys().cloned().collect())
    }

    async fn read_matrix(&self, title: &str) -> Result<Vec<Vec<String>>, SheetError> {
        {
            let mut failures = self.fail_reads.lock().await;
            if let Some(remaining) = failures.get_mut(title) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SheetError::Http {
                        status: 503,
                        context: title.to_string(),
                    });
                }
            }
        }
        self.tabs
            .lock()
            .await
            .get(title)
            .cloned()
            .ok_or(SheetError::TabNotFound { tag: "memory" })
    }

    async fn append_row(&self, title: &str, row: &[String]) -> Result<(), SheetError> {
        self.push_row(title, row.to_vec()).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tab discovery
// ---------------------------------------------------------------------------

/// Accepted title spellings per tab, compared diacritics-stripped and
/// case-folded so "Khách hàng Thẩm mỹ" and "Khach hang Tham my" both hit.
pub fn title_variants(tag: SourceTag) -> &'static [&'static str] {
    match tag {
        SourceTag::ThamMy => &["Khach hang Tham my", "Tham my", "Khach Tham my"],
        SourceTag::NhaKhoa => &["Khach hang Nha khoa", "Nha khoa", "Khach Nha khoa"],
        SourceTag::GioiThieu => &["Khach gioi thieu", "Gioi thieu", "Khach hang gioi thieu"],
    }
}

/// Pick the worksheet for a tab out of the spreadsheet's actual titles.
pub fn resolve_tab_title(titles: &[String], tag: SourceTag) -> Option<String> {
    let variants: Vec<String> = title_variants(tag).iter().map(|v| normalize_label(v)).collect();
    titles
        .iter()
        .find(|title| variants.contains(&normalize_label(title)))
        .cloned()
}

// ---------------------------------------------------------------------------
// Header lookup
// ---------------------------------------------------------------------------

/// Logical columns the extractor knows how to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    DateEntered,
    Name,
    Phone,
    Branch,
    ApptDate,
    Time,
    Service,
    Gross,
    Deposit,
    Balance,
    Closer,
    Note,
    Status,
    Region,
    ReferrerPhone,
}

fn synonyms(column: Column) -> &'static [&'static str] {
    match column {
        Column::DateEntered => &["ngay nhap", "ngay vao", "date", "ngay"],
        Column::Name => &["ten khach hang", "ho ten", "ten", "khach hang", "name"],
        Column::Phone => &["sdt", "so dien thoai", "dien thoai", "phone"],
        Column::Branch => &["chi nhanh", "co so", "branch"],
        Column::ApptDate => &["ngay hen lam", "ngay hen", "ngay lam", "lich hen"],
        Column::Time => &["gio", "gio hen", "time"],
        Column::Service => &["dich vu", "noi dung", "dich vu quan tam", "service"],
        Column::Gross => &["tong tien", "gia", "thanh tien", "doanh thu"],
        Column::Deposit => &["coc", "dat coc", "tien coc"],
        Column::Balance => &["con lai", "can thanh toan", "no"],
        Column::Closer => &["nguoi chot", "ctv chot", "sale", "closer"],
        Column::Note => &["ghi chu", "note"],
        Column::Status => &["trang thai", "tinh trang", "status"],
        Column::Region => &["khu vuc", "vung", "mien", "region"],
        Column::ReferrerPhone => &["sdt nguoi gioi thieu", "nguoi gioi thieu", "ctv gioi thieu"],
    }
}

/// Column index per logical field, located in the header row by synonym.
/// Missing headers are simply absent; extraction then yields empty fields.
#[derive(Debug, Default, Clone)]
pub struct HeaderMap {
    indexes: HashMap<Column, usize>,
}

impl HeaderMap {
    pub fn from_header_row(header: &[String]) -> Self {
        let normalized: Vec<String> = header.iter().map(|h| normalize_label(h)).collect();
        let mut indexes = HashMap::new();
        for column in [
            Column::DateEntered,
            Column::Name,
            Column::Phone,
            Column::Branch,
            Column::ApptDate,
            Column::Time,
            Column::Service,
            Column::Gross,
            Column::Deposit,
            Column::Balance,
            Column::Closer,
            Column::Note,
            Column::Status,
            Column::Region,
            Column::ReferrerPhone,
        ] {
            // Exact equality after folding, so "sdt nguoi gioi thieu" never
            // captures the plain phone column.
            if let Some(idx) = normalized.iter().position(|h| {
                synonyms(column).iter().any(|syn| h == &normalize_label(syn))
            }) {
                indexes.insert(column, idx);
            }
        }
        Self { indexes }
    }

    pub fn get<'a>(&self, row: &'a [String], column: Column) -> &'a str {
        self.indexes
            .get(&column)
            .and_then(|idx| row.get(*idx))
            .map(String::as_str)
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Field cleaners
// ---------------------------------------------------------------------------

/// Accepts `dd/mm/yyyy`, `dd/mm/yy` and `yyyy-mm-dd`. The two-digit-year
/// format goes first: `%Y` happily takes "26" as year 26, while `%y` leaves
/// a four-digit year with trailing digits and falls through.
pub fn clean_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in ["%d/%m/%y", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

/// Strip thousands separators and currency suffixes, parse as integer minor
/// units. `None` means the cell held something that is not money.
pub fn clean_money(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(0);
    }
    let negative = trimmed.starts_with('-');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let value: i64 = digits.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn truncate(value: &str, width: usize) -> String {
    value.trim().chars().take(width).collect()
}

/// Extraction outcome for one tab. Malformed cells become defaults and are
/// only counted; an empty cleaned phone drops the whole row.
#[derive(Debug, Default)]
pub struct ParsedTab {
    pub rows: Vec<NewVisit>,
    pub dropped_missing_phone: usize,
    pub malformed_cells: usize,
}

/// Turn a raw worksheet matrix (header row first) into cleaned visit rows.
pub fn parse_tab(tag: SourceTag, matrix: &[Vec<String>]) -> ParsedTab {
    let mut parsed = ParsedTab::default();
    let Some((header, data)) = matrix.split_first() else {
        return parsed;
    };
    let headers = HeaderMap::from_header_row(header);

    for row in data {
        let phone = canonical_phone(headers.get(row, Column::Phone));
        if phone.is_empty() {
            parsed.dropped_missing_phone += 1;
            continue;
        }

        let mut malformed = 0usize;
        let mut date_field = |raw: &str| {
            let cleaned = clean_date(raw);
            if cleaned.is_none() && !raw.trim().is_empty() {
                malformed += 1;
            }
            cleaned
        };
        let date_entered = date_field(headers.get(row, Column::DateEntered));
        let appt_date = date_field(headers.get(row, Column::ApptDate));

        let mut money_field = |raw: &str| match clean_money(raw) {
            Some(value) => value,
            None => {
                malformed += 1;
                0
            }
        };
        let gross = money_field(headers.get(row, Column::Gross));
        let deposit = money_field(headers.get(row, Column::Deposit));
        let balance = money_field(headers.get(row, Column::Balance));

        let status_raw = headers.get(row, Column::Status).trim();
        let status = if status_raw.is_empty() {
            DEFAULT_STATUS.to_string()
        } else {
            truncate(status_raw, STATUS_WIDTH)
        };

        // The referral tab has no closer column; the referrer phone fills
        // that role so commissions attribute to the referring collaborator.
        let closer_raw = match tag {
            SourceTag::GioiThieu => headers.get(row, Column::ReferrerPhone),
            _ => headers.get(row, Column::Closer),
        };

        parsed.rows.push(NewVisit {
            date_entered,
            name: truncate(headers.get(row, Column::Name), NAME_WIDTH),
            phone: truncate(&phone, PHONE_WIDTH),
            branch: truncate(headers.get(row, Column::Branch), SHORT_WIDTH),
            appt_date,
            time: truncate(headers.get(row, Column::Time), TIME_WIDTH),
            service: truncate(headers.get(row, Column::Service), SERVICE_WIDTH),
            gross,
            deposit,
            balance,
            closer: truncate(closer_raw, SHORT_WIDTH),
            note: truncate(headers.get(row, Column::Note), NOTE_WIDTH),
            status,
            source: tag,
            region: match tag {
                SourceTag::GioiThieu => {
                    let region = headers.get(row, Column::Region).trim();
                    (!region.is_empty()).then(|| truncate(region, SHORT_WIDTH))
                }
                _ => None,
            },
        });
        parsed.malformed_cells += malformed;
    }
    parsed
}

/// Row layout used when the booking endpoint appends to the referral tab.
pub fn booking_sheet_row(visit: &NewVisit) -> Vec<String> {
    vec![
        visit
            .date_entered
            .map(|d| d.format("%d/%m/%Y").to_string())
            .unwrap_or_default(),
        visit.name.clone(),
        visit.phone.clone(),
        visit.service.clone(),
        visit.note.clone(),
        visit.region.clone().unwrap_or_default(),
        visit.closer.clone(),
    ]
}
