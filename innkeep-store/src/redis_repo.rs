use async_trait::async_trait;
use chrono::{DateTime, Utc};
use innkeep_core::hold::{Lease, PaymentHold};
use innkeep_core::repository::PaymentHoldStore;
use innkeep_core::{CoreError, CoreResult};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const HOLD_PREFIX: &str = "payment:user:";
const LEASE_PREFIX: &str = "payment:lease:";

// Replace the hash only while no initial hold occupies it.
// ARGV[1] is the initial status, the rest are field/value pairs.
const HOLD_IF_ABSENT: &str = r#"
    if redis.call("HGET", KEYS[1], "status") == ARGV[1] then
        return 0
    end
    redis.call("DEL", KEYS[1])
    redis.call("HSET", KEYS[1], unpack(ARGV, 2))
    return 1
"#;

const COMPARE_AND_SET_STATUS: &str = r#"
    if redis.call("HGET", KEYS[1], "status") == ARGV[1] then
        redis.call("HSET", KEYS[1], "status", ARGV[2], "updated_at", ARGV[3])
        return 1
    end
    return 0
"#;

const ATTACH_BOOKING: &str = r#"
    if redis.call("HGET", KEYS[1], "order_id") == ARGV[1] then
        redis.call("HSET", KEYS[1], "booking_id", ARGV[2], "updated_at", ARGV[3])
        return 1
    end
    return 0
"#;

const REMOVE_IF_ORDER: &str = r#"
    if redis.call("HGET", KEYS[1], "order_id") == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

const RELEASE_LEASE: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    end
    return 0
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> CoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)
    }

    pub async fn ping(&self) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(cache_err)?;
        Ok(())
    }
}

fn cache_err(e: redis::RedisError) -> CoreError {
    CoreError::StoreError(format!("cache: {}", e))
}

fn hold_key(user_id: i64) -> String {
    format!("{}{}", HOLD_PREFIX, user_id)
}

fn lease_key(user_id: i64) -> String {
    format!("{}{}", LEASE_PREFIX, user_id)
}

/// Flattens a hold into hash fields. Absent optionals are stored as empty strings.
pub fn hold_to_fields(hold: &PaymentHold) -> Vec<(&'static str, String)> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    vec![
        ("order_id", hold.order_id.to_string()),
        ("user_id", hold.user_id.to_string()),
        ("payment_id", hold.payment_id.clone()),
        ("amount", hold.amount.to_string()),
        ("client_secret", opt(&hold.client_secret)),
        ("transaction_id", hold.transaction_id.clone()),
        ("customer_id", hold.customer_id.to_string()),
        ("room_id", hold.room_id.to_string()),
        ("booking_id", hold.booking_id.map(|id| id.to_string()).unwrap_or_default()),
        ("status", hold.status.clone()),
        ("response", opt(&hold.response)),
        ("payment_url", opt(&hold.payment_url)),
        ("capture_method", opt(&hold.capture_method)),
        ("created_at", hold.created_at.to_rfc3339()),
        ("updated_at", hold.updated_at.to_rfc3339()),
    ]
}

/// Rebuilds a hold from `HGETALL` output. An empty map means no hold.
pub fn hold_from_fields(fields: &HashMap<String, String>) -> CoreResult<Option<PaymentHold>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let required = |name: &str| -> CoreResult<&str> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CoreError::StoreError(format!("hold is missing field {}", name)))
    };
    let optional = |name: &str| -> Option<String> {
        fields.get(name).filter(|v| !v.is_empty()).cloned()
    };
    let corrupt = |name: &str| CoreError::StoreError(format!("hold field {} is malformed", name));
    let parse_i64 = |name: &str| -> CoreResult<i64> {
        required(name)?.parse::<i64>().map_err(|_| corrupt(name))
    };
    let parse_time = |name: &str| -> CoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(required(name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| corrupt(name))
    };

    let booking_id = match optional("booking_id") {
        Some(raw) => Some(raw.parse::<i64>().map_err(|_| corrupt("booking_id"))?),
        None => None,
    };

    Ok(Some(PaymentHold {
        order_id: Uuid::parse_str(required("order_id")?).map_err(|_| corrupt("order_id"))?,
        user_id: parse_i64("user_id")?,
        payment_id: required("payment_id")?.to_string(),
        amount: required("amount")?.parse::<f64>().map_err(|_| corrupt("amount"))?,
        client_secret: optional("client_secret"),
        transaction_id: required("transaction_id")?.to_string(),
        customer_id: parse_i64("customer_id")?,
        room_id: parse_i64("room_id")?,
        booking_id,
        status: required("status")?.to_string(),
        response: optional("response"),
        payment_url: optional("payment_url"),
        capture_method: optional("capture_method"),
        created_at: parse_time("created_at")?,
        updated_at: parse_time("updated_at")?,
    }))
}

#[async_trait]
impl PaymentHoldStore for RedisClient {
    async fn hold(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        let key = hold_key(user_id);
        let fields = hold_to_fields(hold);

        redis::pipe()
            .atomic()
            .del(&key)
            .ignore()
            .hset_multiple(&key, fields.as_slice())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(cache_err)?;

        info!(user_id, order_id = %hold.order_id, "Payment hold stored");
        Ok(())
    }

    async fn hold_if_absent(&self, user_id: i64, hold: &PaymentHold) -> CoreResult<bool> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(HOLD_IF_ABSENT);
        let mut invocation = script.key(hold_key(user_id));
        invocation.arg(innkeep_core::hold::HOLD_STATUS_INITIAL);
        for (field, value) in hold_to_fields(hold) {
            invocation.arg(field).arg(value);
        }

        let written: i64 = invocation.invoke_async(&mut conn).await.map_err(cache_err)?;
        debug!(user_id, written, "Conditional hold write");
        Ok(written == 1)
    }

    async fn get_active(&self, user_id: i64) -> CoreResult<Option<PaymentHold>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            conn.hgetall(hold_key(user_id)).await.map_err(cache_err)?;
        hold_from_fields(&fields)
    }

    async fn update_status(&self, user_id: i64, expected: &str, status: &str) -> CoreResult<bool> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(COMPARE_AND_SET_STATUS);
        let swapped: i64 = script
            .key(hold_key(user_id))
            .arg(expected)
            .arg(status)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(swapped == 1)
    }

    async fn attach_booking(&self, user_id: i64, order_id: Uuid, booking_id: i64) -> CoreResult<bool> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(ATTACH_BOOKING);
        let attached: i64 = script
            .key(hold_key(user_id))
            .arg(order_id.to_string())
            .arg(booking_id)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(attached == 1)
    }

    async fn remove(&self, user_id: i64) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(hold_key(user_id)).await.map_err(cache_err)?;
        Ok(())
    }

    async fn remove_if_order(&self, user_id: i64, order_id: Uuid) -> CoreResult<bool> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(REMOVE_IF_ORDER);
        let removed: i64 = script
            .key(hold_key(user_id))
            .arg(order_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(removed == 1)
    }

    async fn list_holds(&self) -> CoreResult<Vec<PaymentHold>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}*", HOLD_PREFIX);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(cache_err)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut holds = Vec::with_capacity(keys.len());
        for key in keys {
            let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(cache_err)?;
            // Removed between SCAN and HGETALL
            if let Some(hold) = hold_from_fields(&fields)? {
                holds.push(hold);
            }
        }
        Ok(holds)
    }

    async fn acquire_lease(&self, user_id: i64, ttl: Duration) -> CoreResult<Option<Lease>> {
        let mut conn = self.connection().await?;
        let token = Uuid::new_v4().to_string();

        // SET NX: Only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(lease_key(user_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;

        Ok(result.map(|_| Lease { user_id, token }))
    }

    async fn release_lease(&self, lease: &Lease) -> CoreResult<()> {
        let mut conn = self.connection().await?;
        let script = redis::Script::new(RELEASE_LEASE);
        let _: i64 = script
            .key(lease_key(lease.user_id))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use innkeep_core::payment::PaymentSession;

    fn sample_hold() -> PaymentHold {
        let session = PaymentSession {
            id: "cs_test_1".to_string(),
            client_secret: Some("cs_test_1_secret".to_string()),
            url: Some("https://checkout.stripe.com/c/pay/cs_test_1".to_string()),
            status: "open".to_string(),
            capture_method: None,
            description: Some("booking_12".to_string()),
        };
        PaymentHold::open(Uuid::new_v4(), 7, 12, 100.0, &session)
    }

    fn as_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_hold_fields_restore_the_hold() {
        let mut hold = sample_hold();
        hold.booking_id = Some(42);

        let restored = hold_from_fields(&as_map(hold_to_fields(&hold))).unwrap().unwrap();
        assert_eq!(restored.order_id, hold.order_id);
        assert_eq!(restored.booking_id, Some(42));
        assert_eq!(restored.capture_method, None);
        assert_eq!(restored.client_secret.as_deref(), Some("cs_test_1_secret"));
        assert_eq!(restored.created_at.timestamp(), hold.created_at.timestamp());
    }

    #[test]
    fn test_empty_hash_is_no_hold() {
        assert!(hold_from_fields(&HashMap::new()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_hash_is_a_store_error() {
        let mut fields = as_map(hold_to_fields(&sample_hold()));
        fields.insert("room_id".to_string(), "twelve".to_string());
        assert!(matches!(hold_from_fields(&fields), Err(CoreError::StoreError(_))));

        fields.remove("order_id");
        assert!(matches!(hold_from_fields(&fields), Err(CoreError::StoreError(_))));
    }

    #[test]
    fn test_keys_are_namespaced_per_user() {
        assert_eq!(hold_key(7), "payment:user:7");
        assert_eq!(lease_key(7), "payment:lease:7");
    }
}
