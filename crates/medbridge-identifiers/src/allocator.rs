//! 标识符分配器
//!
//! 前缀模式 "9..." = 字面前缀9 + 3位随机数字; 区间模式为[min,max]
//! 均匀随机; 无配置时退化为序列取号（起始1000）。候选生成后查询
//! 标识符存储, 已占用则重试, 上限100次后报池耗尽。

use medbridge_core::models::{
    GenerationMode, IdentifierKind, IdentifierNamespace, IdentifierRecord,
};
use medbridge_core::{BridgeError, Result};
use medbridge_store::{KeyedLocks, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 100;

/// 随机数字来源（测试可注入确定序列）
pub trait DigitSource: Send {
    /// [0, max_inclusive]内均匀取值
    fn next_value(&mut self, max_inclusive: i64) -> i64;
}

/// 默认随机来源
pub struct RandomDigits {
    rng: StdRng,
}

impl RandomDigits {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for RandomDigits {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitSource for RandomDigits {
    fn next_value(&mut self, max_inclusive: i64) -> i64 {
        self.rng.gen_range(0..=max_inclusive)
    }
}

/// 确定性序列来源
pub struct SequenceDigits {
    values: Vec<i64>,
    index: usize,
}

impl SequenceDigits {
    pub fn new(values: Vec<i64>) -> Self {
        Self { values, index: 0 }
    }
}

impl DigitSource for SequenceDigits {
    fn next_value(&mut self, max_inclusive: i64) -> i64 {
        let v = self.values[self.index % self.values.len()];
        self.index += 1;
        v.min(max_inclusive)
    }
}

/// 分配结果
#[derive(Debug, Clone)]
pub struct AllocatedIdentifier {
    pub value: String,
    pub collisions: u32,
}

/// 解析前缀模式 → (字面前缀, 随机位数)
fn parse_prefix_pattern(pattern: &str) -> Result<(String, usize)> {
    if pattern.is_empty() {
        return Err(BridgeError::Config("empty prefix pattern".to_string()));
    }
    let dots = pattern.chars().rev().take_while(|c| *c == '.').count();
    let prefix = &pattern[..pattern.len() - dots];
    if !prefix.chars().all(|c| c.is_ascii_digit()) {
        return Err(BridgeError::Config(format!(
            "prefix {prefix:?} must contain digits only"
        )));
    }
    Ok((prefix.to_string(), dots))
}

/// 接受线上INS值: 15位数字, 否则拒绝
pub fn accept_ins(value: &str) -> Result<()> {
    if value.len() == 15 && value.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(BridgeError::InsFormatInvalid(value.to_string()))
    }
}

/// 标识符分配服务
pub struct IdentifierAllocator {
    store: Arc<dyn Store>,
    locks: KeyedLocks<String>,
    digits: Mutex<Box<dyn DigitSource>>,
    collision_total: AtomicU64,
}

impl IdentifierAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_digit_source(store, Box::new(RandomDigits::new()))
    }

    pub fn with_digit_source(store: Arc<dyn Store>, digits: Box<dyn DigitSource>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            digits: Mutex::new(digits),
            collision_total: AtomicU64::new(0),
        }
    }

    /// 累计冲突计数
    pub fn collision_total(&self) -> u64 {
        self.collision_total.load(Ordering::Relaxed)
    }

    /// 分配一个标识符并登记占用
    ///
    /// 候选生成、唯一性检查与登记在(命名空间,类型)锁下原子完成,
    /// 并发场景执行间不竞争。
    pub async fn allocate(
        &self,
        namespace: &IdentifierNamespace,
        override_pattern: Option<&str>,
        subject_id: Option<Uuid>,
    ) -> Result<AllocatedIdentifier> {
        if namespace.kind == IdentifierKind::Ins {
            return Err(BridgeError::Validation(
                "INS values are never generated".to_string(),
            ));
        }

        let lock_key = format!("{}:{}", namespace.system, namespace.kind.as_str());
        let _guard = self.locks.acquire(lock_key).await;

        let pattern = override_pattern
            .map(String::from)
            .or_else(|| namespace.prefix_pattern.clone());

        let mut collisions = 0u32;
        for _ in 0..MAX_ATTEMPTS {
            let candidate = self.next_candidate(namespace, pattern.as_deref()).await?;
            let taken = self
                .store
                .identifier_exists(namespace.kind, &namespace.system, &candidate)
                .await?;
            if taken {
                collisions += 1;
                self.collision_total.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.store
                .insert_identifier(IdentifierRecord {
                    id: Uuid::new_v4(),
                    value: candidate.clone(),
                    kind: namespace.kind,
                    system: namespace.system.clone(),
                    subject_id,
                    created_at: chrono::Utc::now(),
                })
                .await?;
            return Ok(AllocatedIdentifier {
                value: candidate,
                collisions,
            });
        }

        Err(BridgeError::IdentifierPoolExhausted(format!(
            "no free value after {MAX_ATTEMPTS} attempts in {} ({})",
            namespace.system,
            namespace.kind.as_str()
        )))
    }

    async fn next_candidate(
        &self,
        namespace: &IdentifierNamespace,
        pattern: Option<&str>,
    ) -> Result<String> {
        if let Some(pattern) = pattern {
            let (prefix, digits) = parse_prefix_pattern(pattern)?;
            if digits == 0 {
                return Err(BridgeError::Config(format!(
                    "pattern {pattern:?} has no variable digits"
                )));
            }
            let max = 10_i64.pow(digits as u32) - 1;
            let variable = self.digits.lock().expect("digit source poisoned").next_value(max);
            return Ok(format!("{prefix}{variable:0width$}", width = digits));
        }

        match namespace.mode {
            GenerationMode::Range => {
                let (min, max) = match (namespace.range_min, namespace.range_max) {
                    (Some(min), Some(max)) if min < max => (min, max),
                    _ => {
                        return Err(BridgeError::Config(format!(
                            "namespace {} has an invalid numeric range",
                            namespace.system
                        )))
                    }
                };
                let offset = self
                    .digits
                    .lock()
                    .expect("digit source poisoned")
                    .next_value(max - min);
                Ok((min + offset).to_string())
            }
            GenerationMode::External => Err(BridgeError::Validation(format!(
                "namespace {} is externally assigned",
                namespace.system
            ))),
            GenerationMode::FixedPrefix => {
                // 无模式配置: 序列取号, 起始1000
                let seq = self
                    .store
                    .next_sequence(&format!(
                        "ident:{}:{}",
                        namespace.system,
                        namespace.kind.as_str()
                    ))
                    .await?;
                Ok((999 + seq).to_string())
            }
        }
    }

    /// 校验一个值是否符合命名空间配置
    pub fn validate(&self, namespace: &IdentifierNamespace, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        if let Some(pattern) = &namespace.prefix_pattern {
            let Ok((prefix, digits)) = parse_prefix_pattern(pattern) else {
                return false;
            };
            return value.len() == prefix.len() + digits
                && value.starts_with(prefix.as_str())
                && value[prefix.len()..].chars().all(|c| c.is_ascii_digit());
        }
        match namespace.mode {
            GenerationMode::Range => match (namespace.range_min, namespace.range_max) {
                (Some(min), Some(max)) => value
                    .parse::<i64>()
                    .map(|v| v >= min && v <= max)
                    .unwrap_or(false),
                _ => false,
            },
            _ => true,
        }
    }

    /// 估算命名空间剩余容量 (None = 无限/未知)
    pub fn estimate_available(&self, namespace: &IdentifierNamespace) -> Option<i64> {
        if let Some(pattern) = &namespace.prefix_pattern {
            let (_, digits) = parse_prefix_pattern(pattern).ok()?;
            if digits > 0 {
                return Some(10_i64.pow(digits as u32) - 10_i64.pow(digits as u32 - 1));
            }
            return None;
        }
        match (namespace.mode, namespace.range_min, namespace.range_max) {
            (GenerationMode::Range, Some(min), Some(max)) => Some(max - min + 1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_store::MemoryStore;

    fn namespace(pattern: Option<&str>) -> IdentifierNamespace {
        IdentifierNamespace {
            id: Uuid::new_v4(),
            name: "IPP-TEST".to_string(),
            system: "urn:medbridge:ipp".to_string(),
            oid: Some("1.2.250.1.71".to_string()),
            kind: IdentifierKind::Ipp,
            juridical_entity_id: None,
            mode: GenerationMode::FixedPrefix,
            prefix_pattern: pattern.map(String::from),
            range_min: None,
            range_max: None,
        }
    }

    async fn seed_taken(store: &Arc<dyn Store>, ns: &IdentifierNamespace, values: &[&str]) {
        for v in values {
            store
                .insert_identifier(IdentifierRecord {
                    id: Uuid::new_v4(),
                    value: v.to_string(),
                    kind: ns.kind,
                    system: ns.system.clone(),
                    subject_id: None,
                    created_at: chrono::Utc::now(),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_collision_retry_with_seeded_source() {
        // 已占用9000-9009, 确定源依次给出9000, 9003, 9017
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ns = namespace(Some("9..."));
        let taken: Vec<String> = (0..10).map(|i| format!("900{i}")).collect();
        let taken_refs: Vec<&str> = taken.iter().map(String::as_str).collect();
        seed_taken(&store, &ns, &taken_refs).await;

        let allocator = IdentifierAllocator::with_digit_source(
            store,
            Box::new(SequenceDigits::new(vec![0, 3, 17])),
        );
        let allocated = allocator.allocate(&ns, None, None).await.unwrap();
        assert_eq!(allocated.value, "9017");
        assert_eq!(allocated.collisions, 2);
        assert_eq!(allocator.collision_total(), 2);
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ns = namespace(Some("7."));
        let taken: Vec<String> = (0..10).map(|i| format!("7{i}")).collect();
        let taken_refs: Vec<&str> = taken.iter().map(String::as_str).collect();
        seed_taken(&store, &ns, &taken_refs).await;

        let allocator = IdentifierAllocator::with_digit_source(
            store,
            Box::new(SequenceDigits::new((0..10).collect())),
        );
        let err = allocator.allocate(&ns, None, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::IdentifierPoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_range_mode() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut ns = namespace(None);
        ns.mode = GenerationMode::Range;
        ns.range_min = Some(9_000_000);
        ns.range_max = Some(9_999_999);

        let allocator = IdentifierAllocator::new(store);
        let allocated = allocator.allocate(&ns, None, None).await.unwrap();
        let value: i64 = allocated.value.parse().unwrap();
        assert!((9_000_000..=9_999_999).contains(&value));
        assert!(allocator.validate(&ns, &allocated.value));
        assert_eq!(allocator.estimate_available(&ns), Some(1_000_000));
    }

    #[tokio::test]
    async fn test_sequential_fallback_starts_at_1000() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ns = namespace(None);
        let allocator = IdentifierAllocator::new(store);
        assert_eq!(allocator.allocate(&ns, None, None).await.unwrap().value, "1000");
        assert_eq!(allocator.allocate(&ns, None, None).await.unwrap().value, "1001");
    }

    #[tokio::test]
    async fn test_override_pattern_wins() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ns = namespace(Some("9..."));
        let allocator = IdentifierAllocator::with_digit_source(
            store,
            Box::new(SequenceDigits::new(vec![42])),
        );
        let allocated = allocator.allocate(&ns, Some("501..."), None).await.unwrap();
        assert_eq!(allocated.value, "501042");
    }

    #[tokio::test]
    async fn test_ins_never_generated() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut ns = namespace(Some("9..."));
        ns.kind = IdentifierKind::Ins;
        let allocator = IdentifierAllocator::new(store);
        let err = allocator.allocate(&ns, None, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[test]
    fn test_accept_ins_shape() {
        assert!(accept_ins("160017512345678").is_ok());
        assert!(matches!(
            accept_ins("12345"),
            Err(BridgeError::InsFormatInvalid(_))
        ));
        assert!(matches!(
            accept_ins("16001751234567A"),
            Err(BridgeError::InsFormatInvalid(_))
        ));
    }

    #[test]
    fn test_estimate_pattern_capacity() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let allocator = IdentifierAllocator::new(store);
        assert_eq!(allocator.estimate_available(&namespace(Some("9..."))), Some(900));
    }

    #[test]
    fn test_validate_pattern() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let allocator = IdentifierAllocator::new(store);
        let ns = namespace(Some("9..."));
        assert!(allocator.validate(&ns, "9123"));
        assert!(!allocator.validate(&ns, "8123"));
        assert!(!allocator.validate(&ns, "91234"));
        assert!(!allocator.validate(&ns, "91a3"));
    }
}
