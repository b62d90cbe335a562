//! Prompt templates and message assembly.

use companion_protocol::{ChatMessage, RetrievedDocument};

pub const SYSTEM_PROMPT: &str = "你是一个专门为大学生提供情绪支持的AI助手，名叫\"学习伙伴\"。

你的角色和职责：
1. 理解和共情：认真倾听学生的情绪问题，给予理解和共情
2. 积极引导：用积极、温暖的语气帮助学生应对学习和生活中的情绪挑战
3. 实用建议：提供科学、可行的情绪管理和学习方法
4. 边界意识：对于严重的心理问题，建议寻求专业心理咨询

回复原则：
- 使用温暖、友善的语气
- 回复简洁明了，一般3-5句话
- 避免说教，多用引导性问题
- 承认情绪的正常性
- 提供具体可行的建议
- 如果不确定，诚实告知并建议寻求专业帮助

重要提醒：
- 你不是专业心理咨询师，不能诊断心理疾病
- 对于自杀、自残等严重问题，务必建议立即寻求专业帮助
- 保护用户隐私，不评判用户
";

const UNCATEGORIZED: &str = "未分类";
const NO_KNOWLEDGE: &str = "暂无相关知识库内容";

/// Reply substituted when the completion call fails.
pub fn apology(detail: &str) -> String {
    format!("抱歉，我遇到了一些技术问题：{detail}。请稍后再试。")
}

/// Numbered reference list, one block per document.
pub fn knowledge_context(documents: &[RetrievedDocument]) -> String {
    let blocks: Vec<String> = documents
        .iter()
        .enumerate()
        .map(|(idx, document)| {
            let category = document
                .metadata
                .category
                .as_deref()
                .unwrap_or(UNCATEGORIZED);
            format!("[参考{}] ({category}) {}", idx + 1, document.content)
        })
        .collect();

    let context = blocks.join("\n\n");
    if context.trim().is_empty() {
        NO_KNOWLEDGE.to_owned()
    } else {
        context
    }
}

/// The knowledge-augmented user turn that replaces the raw message.
pub fn augmented_user_turn(user_message: &str, documents: &[RetrievedDocument]) -> String {
    format!(
        "参考以下相关知识库内容，回复用户的问题：\n\n知识库参考：\n{}\n\n用户问题：{user_message}\n\n请结合知识库内容和你的理解，给出温暖、有帮助的回复。如果知识库内容不够相关，你也可以基于你的知识给出建议。\n",
        knowledge_context(documents)
    )
}

/// System prompt, then the history window, then the user turn: augmented
/// when at least one document was retrieved, raw otherwise.
pub fn build_messages<'a>(
    history: impl IntoIterator<Item = &'a ChatMessage>,
    user_message: &str,
    documents: &[RetrievedDocument],
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    messages.extend(history.into_iter().cloned());
    if documents.is_empty() {
        messages.push(ChatMessage::user(user_message));
    } else {
        messages.push(ChatMessage::user(augmented_user_turn(user_message, documents)));
    }
    messages
}
