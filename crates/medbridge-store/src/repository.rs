//! 规范化存储仓库接口
//!
//! 所有写入方经由同一仓库接口访问共享规范化状态; 事务边界为单条消息
//! 或单个场景步骤, 不要求跨venue原子性。实现可为内存表或PostgreSQL。

use async_trait::async_trait;
use medbridge_core::models::{
    Diagnostic, Dossier, IdentifierKind, IdentifierRecord, MessageLogEntry, MessageStatus,
    Movement, NodeKind, Patient, ScenarioRun, ScenarioTemplate, StructureNode, Venue,
};
use medbridge_core::Result;
use uuid::Uuid;

/// 规范化存储仓库
#[async_trait]
pub trait Store: Send + Sync {
    // ========== 患者 ==========

    async fn insert_patient(&self, patient: Patient) -> Result<()>;
    async fn update_patient(&self, patient: Patient) -> Result<()>;
    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>>;

    // ========== 档案 ==========

    async fn insert_dossier(&self, dossier: Dossier) -> Result<()>;
    async fn update_dossier(&self, dossier: Dossier) -> Result<()>;
    async fn get_dossier(&self, id: Uuid) -> Result<Option<Dossier>>;
    async fn dossiers_of_patient(&self, patient_id: Uuid) -> Result<Vec<Dossier>>;
    /// 级联删除档案及其venues/movements（捕获独立性依赖此操作）
    async fn delete_dossier(&self, id: Uuid) -> Result<()>;

    // ========== 住院 ==========

    async fn insert_venue(&self, venue: Venue) -> Result<()>;
    async fn update_venue(&self, venue: Venue) -> Result<()>;
    async fn get_venue(&self, id: Uuid) -> Result<Option<Venue>>;
    async fn venues_of_dossier(&self, dossier_id: Uuid) -> Result<Vec<Venue>>;

    // ========== 移动 ==========

    async fn insert_movement(&self, movement: Movement) -> Result<()>;
    async fn update_movement(&self, movement: Movement) -> Result<()>;
    /// venue的全部移动, 按时间升序
    async fn movements_of_venue(&self, venue_id: Uuid) -> Result<Vec<Movement>>;

    // ========== 标识符 ==========

    /// 插入标识符, (类型, system, 值)唯一性冲突返回IdentifierCollision
    async fn insert_identifier(&self, record: IdentifierRecord) -> Result<()>;
    async fn identifier_exists(
        &self,
        kind: IdentifierKind,
        system: &str,
        value: &str,
    ) -> Result<bool>;
    /// 按(类型, 值)查找持有实体
    async fn find_identifier_subject(
        &self,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Option<Uuid>>;

    // ========== 组织结构 ==========

    async fn upsert_node(&self, node: StructureNode) -> Result<()>;
    async fn get_node(&self, id: Uuid) -> Result<Option<StructureNode>>;
    /// 按(类型, 代码, 法人实体)查找; 法人实体None时跨域查找
    async fn find_nodes(
        &self,
        kind: NodeKind,
        code: &str,
        juridical_entity_id: Option<Uuid>,
    ) -> Result<Vec<StructureNode>>;

    // ========== 消息日志 ==========

    /// 追加日志条目; 控制ID全局唯一, 重复返回DuplicateControlId
    async fn append_log(&self, entry: MessageLogEntry) -> Result<()>;
    /// pending→success|error仅允许一次, 重复转换为编程错误
    async fn set_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<()>;
    async fn find_log_by_control_id(&self, control_id: &str) -> Result<Option<MessageLogEntry>>;
    async fn logs_by_correlation(&self, correlation_id: &str) -> Result<Vec<MessageLogEntry>>;

    // ========== 场景模板 ==========

    async fn insert_template(&self, template: ScenarioTemplate) -> Result<()>;
    async fn get_template(&self, key: &str) -> Result<Option<ScenarioTemplate>>;
    async fn delete_template(&self, key: &str) -> Result<()>;
    async fn list_templates(&self) -> Result<Vec<ScenarioTemplate>>;

    // ========== 场景执行 ==========

    async fn insert_run(&self, run: ScenarioRun) -> Result<()>;
    async fn update_run(&self, run: ScenarioRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<ScenarioRun>>;
    async fn list_runs(&self, template_key: Option<&str>) -> Result<Vec<ScenarioRun>>;

    // ========== 序号 ==========

    /// 命名序列递增取号（档案/住院/移动序号, 按作用域隔离）
    async fn next_sequence(&self, scope: &str) -> Result<i64>;
}
