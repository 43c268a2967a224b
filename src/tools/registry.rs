//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! ToolExecutor 在调用时加超时并把任何失败统一转成 "Error: ..." 文本。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（与 ToolCall.name 对应）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象，表示参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 是否必须与同批其它 sequential 工具按调用顺序依次执行（读写本回合共享状态的工具为 true）
    fn sequential(&self) -> bool {
        false
    }

    /// 执行工具；Err 内容由执行器加上 "Error: " 前缀
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（名称有序，保证 specs 输出稳定）
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    /// 同名工具后注册者覆盖先注册者
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 生成传给 LLM 的工具描述列表
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSpec {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
