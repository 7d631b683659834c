use chrono::{DateTime, Utc};

use crate::model::{LineItem, Order, SaleRow};

/// Payment method stamped on every row. Orders carry no payment information yet.
pub const DEFAULT_PAYMENT_METHOD: &str = "Cartão";

/// One line item together with the shared fields of its parent order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatLine<'a> {
    pub order_id: &'a str,
    pub customer_doc: &'a str,
    pub sold_at: DateTime<Utc>,
    pub item: &'a LineItem,
}

/// Orders without a sale timestamp are dropped before flattening.
pub fn is_sellable(order: &Order) -> bool {
    order.sold_at.is_some()
}

/// Expands an order into one [`FlatLine`] per item, in item order.
///
/// Yields nothing for an order without a sale timestamp.
pub fn flatten(order: &Order) -> impl Iterator<Item = FlatLine<'_>> {
    order.sold_at.into_iter().flat_map(move |sold_at| {
        order.items.iter().map(move |item| FlatLine {
            order_id: &order.order_id,
            customer_doc: &order.customer_doc,
            sold_at,
            item,
        })
    })
}

/// Derives the sale row for one flattened line.
pub fn enrich(line: FlatLine<'_>) -> SaleRow {
    SaleRow {
        customer_id: line.customer_doc.to_string(),
        order_id: line.order_id.to_string(),
        purchased_at: line.sold_at,
        product: line.item.product_name.clone(),
        quantity: line.item.quantity,
        unit_price: line.item.unit_price,
        line_total: f64::from(line.item.quantity) * line.item.unit_price,
        payment_method: DEFAULT_PAYMENT_METHOD.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(name: &str, quantity: i32, unit_price: f64) -> LineItem {
        LineItem {
            product_name: name.to_string(),
            quantity,
            unit_price,
        }
    }

    fn order(sold_at: Option<DateTime<Utc>>, items: Vec<LineItem>) -> Order {
        Order {
            order_id: "O1".to_string(),
            customer_doc: "C1".to_string(),
            items,
            sold_at,
        }
    }

    #[test]
    fn test_fan_out_keeps_item_order() {
        let sold_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let order = order(
            Some(sold_at),
            vec![item("A", 1, 1.0), item("B", 2, 2.0), item("C", 3, 3.0)],
        );

        let rows: Vec<SaleRow> = flatten(&order).map(enrich).collect();
        assert_eq!(rows.len(), 3);
        let products: Vec<&str> = rows.iter().map(|r| r.product.as_str()).collect();
        assert_eq!(products, ["A", "B", "C"]);
        for (row, quantity) in rows.iter().zip([1, 2, 3]) {
            assert_eq!(row.customer_id, "C1");
            assert_eq!(row.order_id, "O1");
            assert_eq!(row.purchased_at, sold_at);
            assert_eq!(row.quantity, quantity);
        }
    }

    #[test]
    fn test_unsold_order_yields_nothing() {
        let order = order(None, vec![item("A", 1, 1.0)]);
        assert!(!is_sellable(&order));
        assert_eq!(flatten(&order).count(), 0);
    }

    #[test]
    fn test_line_total() {
        let sold_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let order = order(Some(sold_at), vec![item("A", 3, 2.5), item("B", 0, 9.99)]);
        let rows: Vec<SaleRow> = flatten(&order).map(enrich).collect();

        assert_eq!(rows[0].line_total, 7.5);
        assert_eq!(rows[1].line_total, 0.0);
        assert!(rows.iter().all(|r| r.payment_method == "Cartão"));
    }
}
