//! 回合层：路由、上下文组装、过程事件与七阶段驱动器

pub mod driver;
pub mod events;
pub mod prompt;
pub mod router;

pub use driver::{TurnConfig, TurnDriver};
pub use events::TurnEvent;
pub use prompt::{build_user_prompt, pov_entity, PromptContext};
pub use router::{Route, RouteDecision, Router, DEFAULT_MAX_ROUNDS, FINISH_KEYWORDS};
