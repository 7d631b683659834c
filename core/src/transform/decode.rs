use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use crate::errors::DecodeError;
use crate::model::{LineItem, Order};

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Order event as published by the storefront. Field names follow the producer's
/// schema; the English names are accepted as aliases.
#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(rename = "id_ordem", alias = "order_id")]
    order_id: String,
    #[serde(rename = "documento_cliente", alias = "customer_doc")]
    customer_doc: String,
    #[serde(rename = "produtos_comprados", alias = "items", default)]
    items: Option<Vec<ItemPayload>>,
    #[serde(rename = "data_hora_venda", alias = "sold_at", default)]
    sold_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemPayload {
    #[serde(rename = "nome_produto", alias = "product_name")]
    product_name: String,
    #[serde(rename = "quantidade", alias = "quantity")]
    quantity: i32,
    #[serde(rename = "preco_unitario", alias = "unit_price")]
    unit_price: f64,
}

/// Parses one raw payload into an [`Order`].
pub fn decode(raw: &[u8]) -> Result<Order, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    let payload: OrderPayload =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed {
            reason: e.to_string(),
        })?;

    let items = payload
        .items
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, item)| validate_item(index, item))
        .collect::<Result<Vec<_>, _>>()?;

    let sold_at = payload.sold_at.as_deref().map(parse_timestamp).transpose()?;

    Ok(Order {
        order_id: payload.order_id,
        customer_doc: payload.customer_doc,
        items,
        sold_at,
    })
}

fn validate_item(index: usize, item: ItemPayload) -> Result<LineItem, DecodeError> {
    if item.quantity < 0 {
        return Err(DecodeError::InvalidItem {
            index,
            field: "quantity",
            reason: format!("must not be negative, got {}", item.quantity),
        });
    }
    if !item.unit_price.is_finite() || item.unit_price < 0.0 {
        return Err(DecodeError::InvalidItem {
            index,
            field: "unit_price",
            reason: format!("must be a non-negative number, got {}", item.unit_price),
        });
    }
    Ok(LineItem {
        product_name: item.product_name,
        quantity: item.quantity,
        unit_price: item.unit_price,
    })
}

/// Accepts RFC 3339 timestamps and offset-less ones, which are read as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DecodeError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| DecodeError::InvalidTimestamp {
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_producer_schema() {
        let raw = br#"{
            "id_ordem": "O1",
            "documento_cliente": "C1",
            "produtos_comprados": [
                {"nome_produto": "Widget", "quantidade": 2, "preco_unitario": 10.0},
                {"nome_produto": "Gadget", "quantidade": 1, "preco_unitario": 5.0}
            ],
            "data_hora_venda": "2024-03-01T12:30:00Z"
        }"#;

        let order = decode(raw).unwrap();
        assert_eq!(order.order_id, "O1");
        assert_eq!(order.customer_doc, "C1");
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].product_name, "Widget");
        assert_eq!(order.items[1].quantity, 1);
        assert_eq!(
            order.sold_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_english_aliases_and_null_timestamp() {
        let raw = br#"{"order_id": "O2", "customer_doc": "C2", "items": [], "sold_at": null}"#;
        let order = decode(raw).unwrap();
        assert_eq!(order.order_id, "O2");
        assert!(order.items.is_empty());
        assert_eq!(order.sold_at, None);
    }

    #[test]
    fn test_missing_items_and_timestamp_default() {
        let order = decode(br#"{"id_ordem": "O3", "documento_cliente": "C3"}"#).unwrap();
        assert!(order.items.is_empty());
        assert!(order.sold_at.is_none());
    }

    #[test]
    fn test_naive_timestamps_are_utc() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01 08:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T08:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T05:00:00-03:00").unwrap(), expected);
        assert!(parse_timestamp("2024-03-01 08:00:00.250").is_ok());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(b""), Err(DecodeError::EmptyPayload));
        assert_eq!(decode(&[0xff, 0xfe]), Err(DecodeError::InvalidUtf8));
        assert!(matches!(
            decode(b"not json"),
            Err(DecodeError::Malformed { .. })
        ));
        // customer document missing
        assert!(matches!(
            decode(br#"{"id_ordem": "O1"}"#),
            Err(DecodeError::Malformed { .. })
        ));
        // quantity with the wrong type
        assert!(matches!(
            decode(br#"{"id_ordem": "O1", "documento_cliente": "C1",
                "produtos_comprados": [{"nome_produto": "W", "quantidade": "two", "preco_unitario": 1.0}]}"#),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            decode(br#"{"id_ordem": "O1", "documento_cliente": "C1", "data_hora_venda": "yesterday"}"#),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn test_negative_values_rejected() {
        let raw = br#"{"id_ordem": "O1", "documento_cliente": "C1",
            "produtos_comprados": [
                {"nome_produto": "W", "quantidade": 1, "preco_unitario": 1.0},
                {"nome_produto": "G", "quantidade": -1, "preco_unitario": 1.0}
            ]}"#;
        assert_eq!(
            decode(raw).unwrap_err(),
            DecodeError::InvalidItem {
                index: 1,
                field: "quantity",
                reason: "must not be negative, got -1".to_string(),
            }
        );

        let raw = br#"{"id_ordem": "O1", "documento_cliente": "C1",
            "produtos_comprados": [{"nome_produto": "W", "quantidade": 1, "preco_unitario": -0.5}]}"#;
        assert!(matches!(
            decode(raw),
            Err(DecodeError::InvalidItem { field: "unit_price", .. })
        ));
    }
}
