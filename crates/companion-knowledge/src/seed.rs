//! Built-in counseling corpora.

use companion_protocol::{DocumentMetadata, NewDocument};

/// `(content, category, type)` triple of a seed document.
pub type SeedEntry = (&'static str, &'static str, &'static str);

/// Loaded automatically the first time a store is opened empty.
pub const INITIAL_KNOWLEDGE: [SeedEntry; 8] = [
    (
        "焦虑是大学生常见的情绪问题。当你感到焦虑时，可以尝试深呼吸练习：缓慢吸气4秒，保持4秒，然后呼气4秒。重复5次可以有效缓解焦虑。",
        "焦虑",
        "应对策略",
    ),
    (
        "学习压力大时，番茄工作法很有效：专注学习25分钟，然后休息5分钟。这样可以提高效率，减少疲劳感。",
        "压力",
        "学习方法",
    ),
    (
        "感到孤独是正常的。可以主动参加学校社团活动，或者约同学一起学习、运动。建立社交联系对心理健康很重要。",
        "孤独",
        "社交建议",
    ),
    (
        "考试前的紧张可以通过积极的自我对话来缓解。告诉自己'我已经准备好了'、'我可以应对'。这种正面暗示能增强信心。",
        "焦虑",
        "心理调节",
    ),
    (
        "长时间学习导致疲惫时，要注意劳逸结合。每隔1-2小时起来走动一下，看看远处，让大脑休息。保证充足睡眠也很关键。",
        "疲惫",
        "健康建议",
    ),
    (
        "遇到学习困难感到沮丧时，可以将大目标分解成小目标。完成每个小目标都给自己一个奖励，这样能保持动力。",
        "沮丧",
        "目标管理",
    ),
    (
        "运动是缓解压力的好方法。每天30分钟的有氧运动，如跑步、游泳或快走，可以释放内啡肽，改善心情。",
        "压力",
        "运动建议",
    ),
    (
        "如果情绪问题持续影响生活和学习，建议寻求专业帮助。大学一般都有心理咨询中心，提供免费或低价的咨询服务。",
        "综合",
        "专业建议",
    ),
];

/// Optional second corpus, loaded on request.
pub const EXTENDED_KNOWLEDGE: [SeedEntry; 10] = [
    (
        "拖延症是很多大学生面临的问题。可以使用'两分钟规则'：如果一件事不超过两分钟就能完成，立即去做。这能帮助你克服开始的障碍。",
        "拖延",
        "行为策略",
    ),
    (
        "睡眠问题会严重影响情绪和学习效率。建议保持规律作息，睡前1小时避免使用电子设备，可以尝试冥想或听轻音乐帮助入睡。",
        "睡眠",
        "健康建议",
    ),
    (
        "完美主义可能带来过度焦虑。学会接受'足够好'的标准，记住进步比完美更重要。给自己犯错的空间。",
        "焦虑",
        "认知调整",
    ),
    (
        "感到overwhelmed（不堪重负）时，停下来列出所有待办事项，按优先级排序，一次只专注一件事。这能让你重获控制感。",
        "压力",
        "时间管理",
    ),
    (
        "正念练习对减压很有效：专注当下，观察自己的呼吸、身体感觉和周围环境，不加评判。每天5-10分钟就有效果。",
        "压力",
        "放松技巧",
    ),
    (
        "人际关系压力是常见的。记住：你无法让所有人都喜欢你，也没必要。专注于建立几段真诚、深入的友谊。",
        "人际关系",
        "社交建议",
    ),
    (
        "写情绪日记是很好的自我疗愈方式。每天花10分钟记录感受和想法，有助于理清思路，发现情绪模式。",
        "综合",
        "自我疗愈",
    ),
    (
        "学习动力不足时，重新审视你的目标。问自己：为什么选择这个专业？未来想成为什么样的人？找到内在驱动力。",
        "困惑",
        "目标设定",
    ),
    (
        "适度的体育锻炼能显著改善情绪。不需要高强度，散步、瑜伽或骑自行车都很好。关键是规律进行。",
        "情绪低落",
        "运动建议",
    ),
    (
        "感到孤独时，主动伸出援手帮助他人。志愿活动或帮助同学，能建立联结感，同时提升自我价值感。",
        "孤独",
        "社交建议",
    ),
];

pub fn to_documents(entries: &[SeedEntry]) -> Vec<NewDocument> {
    entries
        .iter()
        .map(|(content, category, source_type)| {
            NewDocument::new(*content, DocumentMetadata::categorized(*category, *source_type))
        })
        .collect()
}

pub fn initial_documents() -> Vec<NewDocument> {
    to_documents(&INITIAL_KNOWLEDGE)
}

pub fn extended_documents() -> Vec<NewDocument> {
    to_documents(&EXTENDED_KNOWLEDGE)
}
