use std::collections::HashMap;

use chrono::NaiveDate;
use hcsync_core::{CustomerRecord, NotifiableCustomer, StoreRecord};

pub const SMS_PREFERENCE: &str = "SMS";

pub fn wants_sms(customer: &CustomerRecord) -> bool {
    customer
        .delivery_notifications
        .iter()
        .any(|p| p.trim().eq_ignore_ascii_case(SMS_PREFERENCE))
}

/// A store counts as delivered-to today when its delivery date is exactly
/// `today`, it has products linked and it is shown to customers.
pub fn delivered_today(store: &StoreRecord, today: NaiveDate) -> bool {
    store.latest_delivery == Some(today) && !store.product_ids.is_empty() && !store.do_not_display
}

/// Customers to text about today's deliveries, each with the names of their
/// qualifying favorite stores in favorite order.
pub fn select_notifiable(
    customers: &[CustomerRecord],
    stores: &[StoreRecord],
    today: NaiveDate,
) -> Vec<NotifiableCustomer> {
    let by_id: HashMap<&str, &StoreRecord> = stores.iter().map(|s| (s.id.as_str(), s)).collect();

    customers
        .iter()
        .filter(|c| wants_sms(c) && !c.favorite_store_ids.is_empty())
        .filter_map(|customer| {
            let mut favorite_stores: Vec<String> = Vec::new();
            for id in &customer.favorite_store_ids {
                let Some(store) = by_id.get(id.as_str()) else {
                    continue;
                };
                if delivered_today(store, today) && !favorite_stores.contains(&store.store_name) {
                    favorite_stores.push(store.store_name.clone());
                }
            }
            if favorite_stores.is_empty() {
                return None;
            }
            Some(NotifiableCustomer {
                name: customer.name.clone(),
                phone_number: customer.phone_number.clone(),
                favorite_stores,
            })
        })
        .collect()
}
