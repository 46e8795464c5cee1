use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tillsync_core::{DomainError, StockId};

/// Stock row as returned by `stock/fetchAllStock` and `stock/fetchUpdatedStock`.
///
/// Numeric columns arrive as numbers or numeric strings, and `description`,
/// `discounts` and `generics` are JSON documents encoded inside a string, so
/// they are kept loose here and validated by [`Product::from_raw`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStockRecord {
    #[serde(rename = "SID", default)]
    pub sid: Option<Value>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub discounts: Option<Value>,
    #[serde(rename = "expiryDate", default)]
    pub expiry_date: Option<String>,
    #[serde(default)]
    pub generics: Option<Value>,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(rename = "productCode", default)]
    pub product_code: Option<String>,
    #[serde(rename = "productType", default)]
    pub product_type: Option<String>,
    #[serde(rename = "costPrice", default)]
    pub cost_price: Option<Value>,
    #[serde(rename = "sellingPrice", default)]
    pub selling_price: Option<Value>,
    #[serde(rename = "stockIn", default)]
    pub stock_in: Option<Value>,
    #[serde(rename = "stockQty", default)]
    pub stock_qty: Option<Value>,
    #[serde(rename = "stockVersion", default)]
    pub stock_version: Option<Value>,
    #[serde(rename = "isActive", default)]
    pub is_active: Option<Value>,
}

/// A sellable catalog entry as persisted in the local catalog.
///
/// Field names follow the wire/UI naming so the persisted blob stays readable
/// by the POS screens. `discounted`, `Sub` and `qty` are cart defaults seeded
/// from the selling price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(rename = "SID")]
    pub sid: StockId,
    pub brand: Option<String>,
    pub description: String,
    pub description_all: Value,
    pub discounts: Vec<Value>,
    pub expiry_date: Option<String>,
    pub generics: Option<Value>,
    pub manufacturer: Option<String>,
    pub product_code: Option<String>,
    pub product_type: Option<String>,
    pub cost_price: Decimal,
    pub selling_price: Decimal,
    pub discounted: Decimal,
    #[serde(default)]
    pub stock_in: Value,
    pub stock_qty: i64,
    #[serde(default)]
    pub stock_version: Value,
    /// `"1"` for sellable stock, anything else is inactive.
    pub is_active: String,
    #[serde(rename = "Sub")]
    pub sub: Decimal,
    pub qty: u32,
}

impl Product {
    /// Validate and normalize a raw server row.
    ///
    /// Any malformed field rejects the whole record; callers drop it and keep
    /// processing the rest of the page.
    pub fn from_raw(raw: RawStockRecord) -> Result<Self, DomainError> {
        let sid = stock_id(raw.sid.as_ref())?;
        let ctx = |field: &str, err: DomainError| DomainError::parse(format!("SID {sid}: {field}: {err}"));

        let description_all = embedded_json(raw.description.as_ref())
            .map_err(|e| ctx("description", e))?
            .ok_or_else(|| DomainError::parse(format!("SID {sid}: description is missing")))?;
        if description_all.is_null() {
            return Err(DomainError::parse(format!("SID {sid}: description is null")));
        }

        let discounts = match embedded_json(raw.discounts.as_ref()).map_err(|e| ctx("discounts", e))? {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(ctx("discounts", DomainError::parse(format!("expected a list, got {other}"))));
            }
        };

        let generics = match raw.generics.as_ref() {
            Some(Value::String(s)) if is_blank_generics(s) => None,
            other => embedded_json(other).map_err(|e| ctx("generics", e))?,
        };

        let cost_price = decimal(raw.cost_price.as_ref()).map_err(|e| ctx("costPrice", e))?;
        let selling_price = decimal(raw.selling_price.as_ref()).map_err(|e| ctx("sellingPrice", e))?;
        let stock_qty = integer(raw.stock_qty.as_ref()).map_err(|e| ctx("stockQty", e))?;
        let is_active = flag(raw.is_active.as_ref()).map_err(|e| ctx("isActive", e))?;

        Ok(Self {
            sid,
            brand: raw.brand,
            description: display_description(&description_all),
            description_all,
            discounts,
            expiry_date: raw.expiry_date,
            generics,
            manufacturer: raw.manufacturer,
            product_code: raw.product_code,
            product_type: raw.product_type,
            cost_price,
            selling_price,
            discounted: selling_price,
            stock_in: raw.stock_in.unwrap_or(Value::Null),
            stock_qty,
            stock_version: raw.stock_version.unwrap_or(Value::Null),
            is_active,
            sub: selling_price,
            qty: 1,
        })
    }

    /// Parse a raw row straight from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, DomainError> {
        let raw: RawStockRecord =
            serde_json::from_value(value).map_err(|e| DomainError::parse(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Whether this product is sellable.
    pub fn active(&self) -> bool {
        self.is_active == "1"
    }
}

/// The short description shown on the POS screens.
///
/// An empty list, or an object whose values are all empty strings, means "no
/// description"; otherwise the free-text `other` entry is used.
fn display_description(doc: &Value) -> String {
    let blank = match doc {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.values().all(|v| v.as_str() == Some("")),
        _ => false,
    };
    if blank {
        return String::new();
    }
    doc.get("other")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn is_blank_generics(s: &str) -> bool {
    matches!(s.trim(), "" | "[]" | "[\"\"]")
}

/// Decode a JSON document that the server may ship encoded inside a string.
fn embedded_json(value: Option<&Value>) -> Result<Option<Value>, DomainError> {
    match value {
        None => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => serde_json::from_str(s)
            .map(Some)
            .map_err(|e| DomainError::parse(format!("invalid embedded JSON: {e}"))),
        Some(other) => Ok(Some(other.clone())),
    }
}

fn stock_id(value: Option<&Value>) -> Result<StockId, DomainError> {
    let value = value.ok_or_else(|| DomainError::invalid_id("SID is missing"))?;
    serde_json::from_value(value.clone()).map_err(|e| DomainError::invalid_id(format!("SID {value}: {e}")))
}

fn decimal(value: Option<&Value>) -> Result<Decimal, DomainError> {
    let text = match value {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => return Err(DomainError::parse(format!("expected a number, got {other}"))),
        None => return Err(DomainError::parse("missing")),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| DomainError::parse(format!("'{text}': {e}")))
}

fn integer(value: Option<&Value>) -> Result<i64, DomainError> {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(|| DomainError::parse(format!("'{n}' is not an integer"))),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<f64>().map(|f| f.trunc() as i64))
                .map_err(|e| DomainError::parse(format!("'{s}': {e}")))
        }
        Some(other) => Err(DomainError::parse(format!("expected an integer, got {other}"))),
        None => Err(DomainError::parse("missing")),
    }
}

fn flag(value: Option<&Value>) -> Result<String, DomainError> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(if *b { "1" } else { "0" }.to_string()),
        Some(other) => Err(DomainError::parse(format!("unexpected flag {other}"))),
        None => Err(DomainError::parse("missing")),
    }
}
