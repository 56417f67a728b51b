//! Core domain model for the CTV back office: phone identity, status
//! normalization, the referral hierarchy and the commission planner.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ctv-core";

/// Deepest commissionable level. Level 0 is the closer themselves.
pub const MAX_LEVEL: u8 = 4;

/// Fallback per-level rates used when the rate table is empty or unreachable.
pub const DEFAULT_RATES: [f64; 5] = [0.25, 0.05, 0.025, 0.0125, 0.00625];

/// Window within which a customer counts as "returning" for CSKH credit.
pub const RETURNING_WINDOW_DAYS: i64 = 365;

/// Which worksheet a customer row originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    ThamMy,
    NhaKhoa,
    GioiThieu,
}

impl SourceTag {
    pub const ALL: [SourceTag; 3] = [SourceTag::ThamMy, SourceTag::NhaKhoa, SourceTag::GioiThieu];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::ThamMy => "tham_my",
            SourceTag::NhaKhoa => "nha_khoa",
            SourceTag::GioiThieu => "gioi_thieu",
        }
    }

    pub fn parse(value: &str) -> Option<SourceTag> {
        match value {
            "tham_my" => Some(SourceTag::ThamMy),
            "nha_khoa" => Some(SourceTag::NhaKhoa),
            "gioi_thieu" => Some(SourceTag::GioiThieu),
            _ => None,
        }
    }
}

/// Commission variant: `direct` pays the closer's chain, `cskh` pays the
/// original collaborator of a returning customer closed by staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    Direct,
    Cskh,
}

impl CommissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionKind::Direct => "direct",
            CommissionKind::Cskh => "cskh",
        }
    }

    pub fn parse(value: &str) -> Option<CommissionKind> {
        match value {
            "direct" => Some(CommissionKind::Direct),
            "cskh" => Some(CommissionKind::Cskh),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Phone identity
// ---------------------------------------------------------------------------

/// Strip non-digits and truncate to 15. Total: empty in, empty out.
pub fn canonical_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).take(15).collect()
}

/// Last 9 digits of the canonical form, used for cross-tab identity.
pub fn phone_suffix9(raw: &str) -> String {
    let canonical = canonical_phone(raw);
    let skip = canonical.len().saturating_sub(9);
    canonical[skip..].to_string()
}

/// Identity under canonicalization OR last-9-digit equality. Absorbs the
/// leading-zero mismatch between sheet cells and stored codes. Two empty
/// phones never match.
pub fn phones_match(a: &str, b: &str) -> bool {
    let ca = canonical_phone(a);
    let cb = canonical_phone(b);
    if ca.is_empty() || cb.is_empty() {
        return false;
    }
    ca == cb || phone_suffix9(a) == phone_suffix9(b)
}

/// Lookup from free-text phone/code to a collaborator code, keyed on both the
/// canonical form and the 9-digit suffix.
#[derive(Debug, Default, Clone)]
pub struct PhoneIndex {
    by_canonical: HashMap<String, String>,
    by_suffix: HashMap<String, String>,
}

impl PhoneIndex {
    pub fn build<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = PhoneIndex::default();
        for code in codes {
            index.insert(code.as_ref());
        }
        index
    }

    pub fn insert(&mut self, code: &str) {
        let code = code.trim().to_lowercase();
        let canonical = canonical_phone(&code);
        if canonical.is_empty() {
            // Non-numeric codes still resolve by exact form.
            self.by_canonical.insert(code.clone(), code);
            return;
        }
        let suffix = phone_suffix9(&code);
        self.by_canonical.entry(canonical).or_insert_with(|| code.clone());
        self.by_suffix.entry(suffix).or_insert(code);
    }

    /// Resolve a closer cell to a collaborator code, or `None` when the value
    /// does not identify any collaborator (the staff-closure case).
    pub fn resolve(&self, raw: &str) -> Option<&str> {
        let trimmed = raw.trim().to_lowercase();
        if trimmed.is_empty() {
            return None;
        }
        let canonical = canonical_phone(&trimmed);
        if canonical.is_empty() {
            return self.by_canonical.get(&trimmed).map(String::as_str);
        }
        if let Some(code) = self.by_canonical.get(&canonical) {
            return Some(code);
        }
        self.by_suffix.get(&phone_suffix9(&trimmed)).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Text normalization
// ---------------------------------------------------------------------------

/// Fold Vietnamese diacritics to ASCII. Characters outside the folding table
/// pass through unchanged.
pub fn fold_diacritics(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            'à' | 'á' | 'ả' | 'ã' | 'ạ' | 'ă' | 'ằ' | 'ắ' | 'ẳ' | 'ẵ' | 'ặ' | 'â' | 'ầ'
            | 'ấ' | 'ẩ' | 'ẫ' | 'ậ' => 'a',
            'À' | 'Á' | 'Ả' | 'Ã' | 'Ạ' | 'Ă' | 'Ằ' | 'Ắ' | 'Ẳ' | 'Ẵ' | 'Ặ' | 'Â' | 'Ầ'
            | 'Ấ' | 'Ẩ' | 'Ẫ' | 'Ậ' => 'A',
            'è' | 'é' | 'ẻ' | 'ẽ' | 'ẹ' | 'ê' | 'ề' | 'ế' | 'ể' | 'ễ' | 'ệ' => 'e',
            'È' | 'É' | 'Ẻ' | 'Ẽ' | 'Ẹ' | 'Ê' | 'Ề' | 'Ế' | 'Ể' | 'Ễ' | 'Ệ' => 'E',
            'ì' | 'í' | 'ỉ' | 'ĩ' | 'ị' => 'i',
            'Ì' | 'Í' | 'Ỉ' | 'Ĩ' | 'Ị' => 'I',
            'ò' | 'ó' | 'ỏ' | 'õ' | 'ọ' | 'ô' | 'ồ' | 'ố' | 'ổ' | 'ỗ' | 'ộ' | 'ơ' | 'ờ'
            | 'ớ' | 'ở' | 'ỡ' | 'ợ' => 'o',
            'Ò' | 'Ó' | 'Ỏ' | 'Õ' | 'Ọ' | 'Ô' | 'Ồ' | 'Ố' | 'Ổ' | 'Ỗ' | 'Ộ' | 'Ơ' | 'Ờ'
            | 'Ớ' | 'Ở' | 'Ỡ' | 'Ợ' => 'O',
            'ù' | 'ú' | 'ủ' | 'ũ' | 'ụ' | 'ư' | 'ừ' | 'ứ' | 'ử' | 'ữ' | 'ự' => 'u',
            'Ù' | 'Ú' | 'Ủ' | 'Ũ' | 'Ụ' | 'Ư' | 'Ừ' | 'Ứ' | 'Ử' | 'Ữ' | 'Ự' => 'U',
            'ỳ' | 'ý' | 'ỷ' | 'ỹ' | 'ỵ' => 'y',
            'Ỳ' | 'Ý' | 'Ỷ' | 'Ỹ' | 'Ỵ' => 'Y',
            'đ' => 'd',
            'Đ' => 'D',
            other => other,
        })
        .collect()
}

/// Diacritics-stripped, case-folded, whitespace-collapsed comparison form
/// shared by status checks and worksheet title matching.
pub fn normalize_label(input: &str) -> String {
    fold_diacritics(input)
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// A transaction is completed iff its status normalizes to "da den lam".
pub fn is_completed_status(status: &str) -> bool {
    normalize_label(status) == "da den lam"
}

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// `amount × rate`, rounded half-to-even to integer minor units. Every
/// commission amount in the system goes through this one function.
pub fn commission_amount(amount: i64, rate: f64) -> i64 {
    let product = amount as f64 * rate;
    let floor = product.floor();
    let fraction = product - floor;
    let floor_int = floor as i64;
    if (fraction - 0.5).abs() < 1e-9 {
        if floor_int % 2 == 0 {
            floor_int
        } else {
            floor_int + 1
        }
    } else if fraction > 0.5 {
        floor_int + 1
    } else {
        floor_int
    }
}

// ---------------------------------------------------------------------------
// Rate table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateEntry {
    pub level: i16,
    pub rate: f64,
    pub active: bool,
    pub label: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

/// Per-level commission fractions with active flags. An inactive level
/// contributes no row at all, which is distinct from a zero-amount row.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    entries: BTreeMap<i16, RateEntry>,
}

impl Default for RateTable {
    fn default() -> Self {
        let entries = DEFAULT_RATES
            .iter()
            .enumerate()
            .map(|(level, rate)| {
                let level = level as i16;
                (
                    level,
                    RateEntry {
                        level,
                        rate: *rate,
                        active: true,
                        label: format!("Level {level}"),
                        updated_at: None,
                        updated_by: None,
                    },
                )
            })
            .collect();
        Self { entries }
    }
}

impl RateTable {
    /// Build from loaded rows; an empty load falls back to the defaults.
    pub fn from_entries(entries: Vec<RateEntry>) -> Self {
        if entries.is_empty() {
            return Self::default();
        }
        Self {
            entries: entries.into_iter().map(|e| (e.level, e)).collect(),
        }
    }

    /// Active rate for a level, `None` when the level is inactive or unknown.
    pub fn rate(&self, level: i16) -> Option<f64> {
        self.entries
            .get(&level)
            .filter(|e| e.active && e.rate > 0.0)
            .map(|e| e.rate)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RateEntry> {
        self.entries.values()
    }
}

// ---------------------------------------------------------------------------
// Referral hierarchy
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HierarchyViolation {
    #[error("referrer chain would cycle through {code}")]
    Cycle { code: String },
    #[error("referrer chain below {code} would exceed depth {max}")]
    TooDeep { code: String, max: u8 },
    #[error("unknown referrer {code}")]
    UnknownReferrer { code: String },
}

/// Ancestor chain including the starting code at level 0, ascending level.
/// `truncated_by_cycle` flags a revisit encountered during the walk; the
/// chain is cut at the revisit rather than erroring.
#[derive(Debug, Clone, PartialEq)]
pub struct AncestorChain {
    pub chain: Vec<(String, u8)>,
    pub truncated_by_cycle: bool,
}

/// In-memory snapshot of the collaborator forest: one adjacency map loaded
/// from the `ctv` table, with every query a single bounded traversal.
#[derive(Debug, Default, Clone)]
pub struct ParentMap {
    parents: HashMap<String, Option<String>>,
    children: HashMap<String, Vec<String>>,
}

impl ParentMap {
    pub fn new(pairs: impl IntoIterator<Item = (String, Option<String>)>) -> Self {
        let mut map = ParentMap::default();
        for (code, referrer) in pairs {
            map.insert(&code, referrer.as_deref());
        }
        map
    }

    pub fn insert(&mut self, code: &str, referrer: Option<&str>) {
        let code = code.trim().to_lowercase();
        let referrer = referrer
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty() && *r != code);
        if let Some(parent) = &referrer {
            self.children.entry(parent.clone()).or_default().push(code.clone());
        }
        self.parents.insert(code, referrer);
    }

    pub fn contains(&self, code: &str) -> bool {
        self.parents.contains_key(&code.trim().to_lowercase())
    }

    pub fn parent(&self, code: &str) -> Option<&str> {
        self.parents
            .get(&code.trim().to_lowercase())
            .and_then(|p| p.as_deref())
    }

    /// Walk up at most `max_depth` referrers. Missing codes yield an empty
    /// chain, and a revisit truncates instead of looping.
    pub fn ancestors(&self, code: &str, max_depth: u8) -> AncestorChain {
        let code = code.trim().to_lowercase();
        if !self.parents.contains_key(&code) {
            return AncestorChain {
                chain: Vec::new(),
                truncated_by_cycle: false,
            };
        }

        let mut chain = vec![(code.clone(), 0u8)];
        let mut visited: HashSet<String> = HashSet::from([code.clone()]);
        let mut current = code;
        let mut truncated = false;
        for level in 1..=max_depth {
            let Some(next) = self.parents.get(&current).and_then(|p| p.clone()) else {
                break;
            };
            if !visited.insert(next.clone()) {
                truncated = true;
                break;
            }
            chain.push((next.clone(), level));
            current = next;
        }
        AncestorChain {
            chain,
            truncated_by_cycle: truncated,
        }
    }

    /// Every code reachable below `code`, unbounded depth. Used for portal
    /// scoping, so the set excludes `code` itself.
    pub fn descendants(&self, code: &str) -> Vec<String> {
        let code = code.trim().to_lowercase();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: Vec<String> = vec![code];
        let mut out = Vec::new();
        while let Some(current) = queue.pop() {
            for child in self.children.get(&current).into_iter().flatten() {
                if seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push(child.clone());
                }
            }
        }
        out.sort();
        out
    }

    pub fn direct_children(&self, code: &str) -> Vec<String> {
        let mut out = self
            .children
            .get(&code.trim().to_lowercase())
            .cloned()
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn max_depth_below(&self, code: &str) -> u8 {
        let code = code.trim().to_lowercase();
        let mut depth = 0u8;
        let mut frontier = vec![code];
        let mut seen: HashSet<String> = HashSet::new();
        while depth < MAX_LEVEL {
            let mut next = Vec::new();
            for current in &frontier {
                for child in self.children.get(current).into_iter().flatten() {
                    if seen.insert(child.clone()) {
                        next.push(child.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            depth += 1;
            frontier = next;
        }
        depth
    }

    /// Descendant counts per level 1..=4 plus the bounded total.
    pub fn stats(&self, code: &str) -> NetworkStats {
        let code = code.trim().to_lowercase();
        let mut by_level = [0usize; MAX_LEVEL as usize];
        let mut frontier = vec![code];
        let mut seen: HashSet<String> = HashSet::new();
        for level in 0..MAX_LEVEL as usize {
            let mut next = Vec::new();
            for current in &frontier {
                for child in self.children.get(current).into_iter().flatten() {
                    if seen.insert(child.clone()) {
                        next.push(child.clone());
                    }
                }
            }
            by_level[level] = next.len();
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        NetworkStats {
            total: by_level.iter().sum(),
            by_level,
        }
    }

    /// Validate setting `child`'s referrer to `new_parent` before writing.
    /// Rejects unknown referrers, reachability cycles and chains that would
    /// exceed [`MAX_LEVEL`]; the caller leaves the tree untouched on error.
    pub fn check_reparent(&self, child: &str, new_parent: &str) -> Result<(), HierarchyViolation> {
        let child = child.trim().to_lowercase();
        let new_parent = new_parent.trim().to_lowercase();
        if !self.parents.contains_key(&new_parent) {
            return Err(HierarchyViolation::UnknownReferrer { code: new_parent });
        }
        if child == new_parent {
            return Err(HierarchyViolation::Cycle { code: child });
        }

        // Cycle iff the child is already reachable walking up from the parent.
        let mut current = new_parent.clone();
        let mut visited: HashSet<String> = HashSet::from([current.clone()]);
        let mut depth_above = 0u8;
        loop {
            let Some(next) = self.parents.get(&current).and_then(|p| p.clone()) else {
                break;
            };
            if next == child {
                return Err(HierarchyViolation::Cycle { code: child });
            }
            if !visited.insert(next.clone()) {
                break;
            }
            depth_above += 1;
            current = next;
        }

        let subtree = if self.parents.contains_key(&child) {
            self.max_depth_below(&child)
        } else {
            0
        };
        if depth_above + 1 + subtree > MAX_LEVEL {
            return Err(HierarchyViolation::TooDeep {
                code: child,
                max: MAX_LEVEL,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub total: usize,
    pub by_level: [usize; MAX_LEVEL as usize],
}

// ---------------------------------------------------------------------------
// Commission planner
// ---------------------------------------------------------------------------

/// One commission row as the planner wants it persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedCommission {
    pub collaborator_code: String,
    pub level: i16,
    pub rate: f64,
    pub transaction_amount: i64,
    pub commission_amount: i64,
    pub kind: CommissionKind,
}

/// Direct mode: one row per ancestor of the closer at an active level. The
/// chain is never compressed; deactivating level 1 still credits level 2 to
/// the ancestor two hops up.
pub fn plan_direct(
    parents: &ParentMap,
    rates: &RateTable,
    closer_code: &str,
    amount: i64,
) -> Vec<PlannedCommission> {
    let chain = parents.ancestors(closer_code, MAX_LEVEL);
    chain
        .chain
        .into_iter()
        .filter_map(|(code, level)| {
            let level = level as i16;
            let rate = rates.rate(level)?;
            Some(PlannedCommission {
                collaborator_code: code,
                level,
                rate,
                transaction_amount: amount,
                commission_amount: commission_amount(amount, rate),
                kind: CommissionKind::Direct,
            })
        })
        .collect()
}

/// CSKH mode: exactly level 1 to the original collaborator and level 2 to
/// their referrer, active flags respected. The chain stops there; no level 0
/// and nothing above level 2.
pub fn plan_cskh(
    parents: &ParentMap,
    rates: &RateTable,
    original_code: &str,
    amount: i64,
) -> Vec<PlannedCommission> {
    let original = original_code.trim().to_lowercase();
    if original.is_empty() {
        return Vec::new();
    }
    let mut rows = Vec::new();
    if let Some(rate) = rates.rate(1) {
        rows.push(PlannedCommission {
            collaborator_code: original.clone(),
            level: 1,
            rate,
            transaction_amount: amount,
            commission_amount: commission_amount(amount, rate),
            kind: CommissionKind::Cskh,
        });
    }
    if let Some(parent) = parents.parent(&original) {
        if let Some(rate) = rates.rate(2) {
            rows.push(PlannedCommission {
                collaborator_code: parent.to_string(),
                level: 2,
                rate,
                transaction_amount: amount,
                commission_amount: commission_amount(amount, rate),
                kind: CommissionKind::Cskh,
            });
        }
    }
    rows
}

/// Signed-id convention: `khach_hang` rows store the negated id, `services`
/// rows the plain id, so the sign recovers the source table.
pub fn khach_hang_transaction_id(id: i64) -> i64 {
    -id.abs()
}

// ---------------------------------------------------------------------------
// Persisted shapes shared across crates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collaborator {
    pub code: String,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub referrer_code: Option<String>,
    pub tier: Option<String>,
    pub active: bool,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
}

/// A cleaned visit row that has not been persisted yet: what the sheet
/// adapter and the booking endpoint hand to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVisit {
    pub date_entered: Option<NaiveDate>,
    pub name: String,
    pub phone: String,
    pub branch: String,
    pub appt_date: Option<NaiveDate>,
    pub time: String,
    pub service: String,
    pub gross: i64,
    pub deposit: i64,
    pub balance: i64,
    pub closer: String,
    pub note: String,
    pub status: String,
    pub source: SourceTag,
    pub region: Option<String>,
}

/// A customer visit as stored in `khach_hang`, unified across the three tabs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: i64,
    pub date_entered: Option<NaiveDate>,
    pub name: String,
    pub phone: String,
    pub branch: String,
    pub appt_date: Option<NaiveDate>,
    pub time: String,
    pub service: String,
    pub gross: i64,
    pub deposit: i64,
    pub balance: i64,
    pub closer: String,
    pub note: String,
    pub status: String,
    pub source: SourceTag,
    pub region: Option<String>,
}

/// Legacy dental service line from the `services` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRow {
    pub id: i64,
    pub customer_id: i64,
    pub service_name: String,
    pub date_entered: Option<NaiveDate>,
    pub date_scheduled: Option<NaiveDate>,
    pub amount: i64,
    pub status: String,
    pub closer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionRow {
    pub id: i64,
    pub transaction_id: i64,
    pub collaborator_code: String,
    pub level: i16,
    pub rate: f64,
    pub transaction_amount: i64,
    pub commission_amount: i64,
    pub kind: CommissionKind,
    pub created_at: DateTime<Utc>,
}

impl CommissionRow {
    pub fn is_from_khach_hang(&self) -> bool {
        self.transaction_id < 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Watermark {
    pub last_kh_max_id: i64,
    pub last_svc_max_id: i64,
}

impl Watermark {
    pub const ZERO: Watermark = Watermark {
        last_kh_max_id: 0,
        last_svc_max_id: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> ParentMap {
        // a -> b -> c -> d -> e (a is the leaf closer)
        ParentMap::new([
            ("a".to_string(), Some("b".to_string())),
            ("b".to_string(), Some("c".to_string())),
            ("c".to_string(), Some("d".to_string())),
            ("d".to_string(), Some("e".to_string())),
            ("e".to_string(), None),
        ])
    }

    #[test]
    fn canonical_strips_and_truncates() {
        assert_eq!(canonical_phone(" 097-202-0881 "), "0972020881");
        assert_eq!(canonical_phone("+84 (97) 202 0881"), "84972020881");
        assert_eq!(canonical_phone(""), "");
        assert_eq!(canonical_phone("1234567890123456789"), "123456789012345");
    }

    #[test]
    fn match_absorbs_leading_zero() {
        assert!(phones_match("0972020881", "972020881"));
        assert!(phones_match("+84972020881", "0972020881"));
        assert!(!phones_match("0972020881", "0972020882"));
    }

    #[test]
    fn match_is_symmetric_and_reflexive() {
        for (a, b) in [("0972020881", "972020881"), ("12", "9912"), ("abc", "0abc")] {
            assert_eq!(phones_match(a, b), phones_match(b, a));
        }
        assert!(phones_match("0972020881", "0972020881"));
        assert!(!phones_match("", ""));
        assert!(!phones_match("abc", "def"));
    }

    #[test]
    fn phone_index_resolves_suffix_and_exact() {
        let index = PhoneIndex::build(["0972020881", "0911222333"]);
        assert_eq!(index.resolve("972020881"), Some("0972020881"));
        assert_eq!(index.resolve("+84 972 020 881"), Some("0972020881"));
        assert_eq!(index.resolve("0911222333"), Some("0911222333"));
        assert_eq!(index.resolve("0999999999"), None);
        assert_eq!(index.resolve(""), None);
    }

    #[test]
    fn status_folding_accepts_both_spellings() {
        assert!(is_completed_status("đã đến làm"));
        assert!(is_completed_status("da den lam"));
        assert!(is_completed_status("  Da   Den  Lam "));
        assert!(!is_completed_status("đã cọc"));
        assert!(!is_completed_status(""));
    }

    #[test]
    fn folding_handles_titles() {
        assert_eq!(normalize_label("Khách hàng Thẩm mỹ"), "khach hang tham my");
        assert_eq!(normalize_label("Khách giới thiệu"), "khach gioi thieu");
    }

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(commission_amount(1_000_000, 0.25), 250_000);
        // 2.5 rounds to 2, 3.5 rounds to 4
        assert_eq!(commission_amount(10, 0.25), 2);
        assert_eq!(commission_amount(14, 0.25), 4);
        assert_eq!(commission_amount(13, 0.25), 3);
        assert_eq!(commission_amount(0, 0.25), 0);
    }

    #[test]
    fn rate_table_defaults_when_empty() {
        let table = RateTable::from_entries(Vec::new());
        assert_eq!(table.rate(0), Some(0.25));
        assert_eq!(table.rate(4), Some(0.00625));
        assert_eq!(table.rate(5), None);
    }

    #[test]
    fn rate_table_hides_inactive_levels() {
        let mut entries: Vec<RateEntry> = RateTable::default().entries().cloned().collect();
        entries[2].active = false;
        let table = RateTable::from_entries(entries);
        assert_eq!(table.rate(2), None);
        assert_eq!(table.rate(1), Some(0.05));
    }

    #[test]
    fn ancestors_walk_is_bounded_and_inclusive() {
        let map = family();
        let chain = map.ancestors("a", MAX_LEVEL);
        assert!(!chain.truncated_by_cycle);
        assert_eq!(
            chain.chain,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("c".to_string(), 2),
                ("d".to_string(), 3),
                ("e".to_string(), 4),
            ]
        );
        assert!(map.ancestors("missing", MAX_LEVEL).chain.is_empty());
    }

    #[test]
    fn ancestors_truncate_on_cycle_without_error() {
        let map = ParentMap::new([
            ("a".to_string(), Some("b".to_string())),
            ("b".to_string(), Some("a".to_string())),
        ]);
        let chain = map.ancestors("a", MAX_LEVEL);
        assert!(chain.truncated_by_cycle);
        assert_eq!(chain.chain, vec![("a".to_string(), 0), ("b".to_string(), 1)]);
    }

    #[test]
    fn descendants_and_stats() {
        let map = family();
        assert_eq!(map.descendants("c"), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.max_depth_below("e"), 4);
        assert_eq!(map.max_depth_below("a"), 0);
        let stats = map.stats("d");
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_level, [1, 1, 1, 0]);
    }

    #[test]
    fn reparent_rejects_cycles_and_leaves_tree_alone() {
        let map = family();
        assert_eq!(
            map.check_reparent("e", "a"),
            Err(HierarchyViolation::Cycle { code: "e".to_string() })
        );
        assert_eq!(
            map.check_reparent("b", "b"),
            Err(HierarchyViolation::Cycle { code: "b".to_string() })
        );
        // Map untouched by failed checks.
        assert_eq!(map.parent("e"), None);
        assert_eq!(map.parent("a"), Some("b"));
    }

    #[test]
    fn reparent_rejects_depth_overflow_and_unknown() {
        let map = family();
        // d sits at depth 1 below e; hanging the a..c subtree (depth 2) under d
        // is fine, but hanging it under a (depth 4 below e) is not.
        assert_eq!(
            map.check_reparent("x", "a"),
            Err(HierarchyViolation::TooDeep { code: "x".to_string(), max: MAX_LEVEL })
        );
        assert_eq!(map.check_reparent("x", "c"), Ok(()));
        assert_eq!(
            map.check_reparent("b", "ghost"),
            Err(HierarchyViolation::UnknownReferrer { code: "ghost".to_string() })
        );
    }

    #[test]
    fn direct_plan_pays_five_levels_at_default_rates() {
        let map = family();
        let rates = RateTable::default();
        let rows = plan_direct(&map, &rates, "a", 1_000_000);
        let amounts: Vec<i64> = rows.iter().map(|r| r.commission_amount).collect();
        assert_eq!(amounts, vec![250_000, 50_000, 25_000, 12_500, 6_250]);
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.level <= MAX_LEVEL as i16));
        assert!(rows.iter().all(|r| r.kind == CommissionKind::Direct));
    }

    #[test]
    fn direct_plan_skips_inactive_level_without_compressing() {
        let map = family();
        let mut entries: Vec<RateEntry> = RateTable::default().entries().cloned().collect();
        entries[2].active = false;
        let rates = RateTable::from_entries(entries);
        let rows = plan_direct(&map, &rates, "a", 1_000_000);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.level != 2));
        // Level 3 still goes to the ancestor three hops up.
        let level3 = rows.iter().find(|r| r.level == 3).unwrap();
        assert_eq!(level3.collaborator_code, "d");
        assert_eq!(level3.commission_amount, 12_500);
    }

    #[test]
    fn direct_plan_for_unknown_closer_is_empty() {
        let map = family();
        assert!(plan_direct(&map, &RateTable::default(), "ghost", 500_000).is_empty());
    }

    #[test]
    fn cskh_plan_pays_exactly_two_levels() {
        let map = family();
        let rows = plan_cskh(&map, &RateTable::default(), "a", 2_000_000);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].level, 1);
        assert_eq!(rows[0].collaborator_code, "a");
        assert_eq!(rows[0].commission_amount, 100_000);
        assert_eq!(rows[1].level, 2);
        assert_eq!(rows[1].collaborator_code, "b");
        assert_eq!(rows[1].commission_amount, 50_000);
        assert!(rows.iter().all(|r| r.kind == CommissionKind::Cskh));
    }

    #[test]
    fn cskh_plan_without_parent_stops_at_level_one() {
        let map = family();
        let rows = plan_cskh(&map, &RateTable::default(), "e", 2_000_000);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, 1);
        assert_eq!(rows[0].collaborator_code, "e");
    }

    #[test]
    fn conservation_within_rounding_tolerance() {
        let map = family();
        let rates = RateTable::default();
        for amount in [1_000_000i64, 333_333, 999_999, 1] {
            let rows = plan_direct(&map, &rates, "a", amount);
            let total: i64 = rows.iter().map(|r| r.commission_amount).sum();
            let expected: f64 = rows.iter().map(|r| amount as f64 * r.rate).sum();
            assert!((total as f64 - expected).abs() <= rows.len() as f64);
        }
    }

    #[test]
    fn signed_id_convention() {
        assert_eq!(khach_hang_transaction_id(42), -42);
        assert_eq!(khach_hang_transaction_id(-42), -42);
        let row = CommissionRow {
            id: 1,
            transaction_id: -42,
            collaborator_code: "a".into(),
            level: 0,
            rate: 0.25,
            transaction_amount: 100,
            commission_amount: 25,
            kind: CommissionKind::Direct,
            created_at: Utc::now(),
        };
        assert!(row.is_from_khach_hang());
    }
}
