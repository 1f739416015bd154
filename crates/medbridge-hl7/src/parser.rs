//! HL7 v2消息解析与序列化
//!
//! 分隔符四元组从入站MSH-1/MSH-2读取; 段按声明顺序保留（含未知段）,
//! 字段保持原文, 组件/重复/子组件按需切分。满足往返律:
//! parse(serialize(m)) == m。

use medbridge_core::{BridgeError, Result};

/// HL7分隔符集
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// MSH-2编码四元组
    pub fn encoding_chars(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }
}

/// 单个HL7段
///
/// fields按HL7字段号存放: field(n) = fields[n-1]。对MSH段,
/// field(1)即字段分隔符本身, field(2)为编码字符四元组。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Segment {
    pub id: String,
    pub fields: Vec<String>,
}

impl Hl7Segment {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    /// HL7字段号取值（1起）
    pub fn field(&self, n: usize) -> Option<&str> {
        if n == 0 {
            return Some(&self.id);
        }
        self.fields
            .get(n - 1)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn field_or_empty(&self, n: usize) -> &str {
        self.field(n).unwrap_or("")
    }

    /// 字段的重复列表 (~切分)
    pub fn repetitions<'a>(&'a self, n: usize, delims: &Delimiters) -> Vec<&'a str> {
        match self.field(n) {
            Some(raw) => raw.split(delims.repetition).collect(),
            None => Vec::new(),
        }
    }

    /// 首个重复的组件取值（1起）
    pub fn component<'a>(&'a self, n: usize, comp: usize, delims: &Delimiters) -> Option<&'a str> {
        let raw = self.field(n)?;
        let first_rep = raw.split(delims.repetition).next()?;
        first_rep
            .split(delims.component)
            .nth(comp - 1)
            .filter(|s| !s.is_empty())
    }

    /// 组件内子组件取值（1起）
    pub fn subcomponent<'a>(
        &'a self,
        n: usize,
        comp: usize,
        sub: usize,
        delims: &Delimiters,
    ) -> Option<&'a str> {
        self.component(n, comp, delims)?
            .split(delims.subcomponent)
            .nth(sub - 1)
            .filter(|s| !s.is_empty())
    }

    /// 设置字段值, 必要时填充空位
    pub fn set_field(&mut self, n: usize, value: impl Into<String>) {
        if n == 0 {
            return;
        }
        while self.fields.len() < n {
            self.fields.push(String::new());
        }
        self.fields[n - 1] = value.into();
    }
}

/// 解析后的HL7消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Message {
    pub delimiters: Delimiters,
    pub segments: Vec<Hl7Segment>,
}

impl Hl7Message {
    /// 解析HL7消息文本
    ///
    /// 行结束符\r\n与\n归一化为\r; 消息必须以MSH开头, 分隔符
    /// 四元组从MSH位置1-2读取。
    pub fn parse(text: &str) -> Result<Self> {
        let normalized = text.replace("\r\n", "\r").replace('\n', "\r");
        let lines: Vec<&str> = normalized
            .split('\r')
            .filter(|l| !l.trim().is_empty())
            .collect();

        let msh_line = lines
            .first()
            .ok_or_else(|| BridgeError::InvalidMsh("empty message".to_string()))?;
        if !msh_line.starts_with("MSH") || msh_line.len() < 8 {
            return Err(BridgeError::InvalidMsh(
                "message must start with a complete MSH segment".to_string(),
            ));
        }

        let chars: Vec<char> = msh_line.chars().collect();
        let delimiters = Delimiters {
            field: chars[3],
            component: chars[4],
            repetition: chars[5],
            escape: chars[6],
            subcomponent: chars[7],
        };

        let mut segments = Vec::with_capacity(lines.len());
        segments.push(Self::parse_msh(msh_line, &delimiters));
        for line in lines.iter().skip(1) {
            segments.push(Self::parse_segment(line, &delimiters)?);
        }

        Ok(Self {
            delimiters,
            segments,
        })
    }

    fn parse_msh(line: &str, delims: &Delimiters) -> Hl7Segment {
        // MSH-1 = 分隔符本身, MSH-2 = 编码字符; 其余字段正常切分
        let rest: &str = &line[4..];
        let mut fields = vec![delims.field.to_string()];
        fields.extend(rest.split(delims.field).map(String::from));
        Hl7Segment {
            id: "MSH".to_string(),
            fields,
        }
    }

    fn parse_segment(line: &str, delims: &Delimiters) -> Result<Hl7Segment> {
        let mut parts = line.split(delims.field);
        let id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::Parse(format!("empty segment: {line:?}")))?
            .to_string();
        Ok(Hl7Segment {
            id,
            fields: parts.map(String::from).collect(),
        })
    }

    /// 序列化为线级文本（段以\r结尾）
    pub fn serialize(&self) -> String {
        let fs = self.delimiters.field;
        let mut out = String::new();
        for segment in &self.segments {
            if segment.id == "MSH" {
                // MSH-1为分隔符本身, 不重复输出
                out.push_str("MSH");
                for f in segment.fields.iter().skip(1) {
                    out.push(fs);
                    out.push_str(f);
                }
            } else {
                out.push_str(&segment.id);
                for f in &segment.fields {
                    out.push(fs);
                    out.push_str(f);
                }
            }
            out.push('\r');
        }
        out
    }

    /// 首个指定类型的段
    pub fn segment(&self, id: &str) -> Option<&Hl7Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// 所有指定类型的段
    pub fn segments_of(&self, id: &str) -> Vec<&Hl7Segment> {
        self.segments.iter().filter(|s| s.id == id).collect()
    }

    /// MSH-9消息类型 (如 "ADT")
    pub fn message_code(&self) -> Option<&str> {
        self.segment("MSH")?.component(9, 1, &self.delimiters)
    }

    /// MSH-9触发事件 (如 "A01")
    pub fn trigger(&self) -> Option<&str> {
        self.segment("MSH")?.component(9, 2, &self.delimiters)
    }

    /// MSH-10控制ID
    pub fn control_id(&self) -> Option<&str> {
        self.segment("MSH")?.field(10)
    }
}

/// 字节载荷解码: UTF-8优先, 失败回退Latin-1, 永不失败
///
/// 返回(文本, 是否发生了Latin-1回退)
pub fn decode_payload(bytes: &[u8]) -> (String, bool) {
    match std::str::from_utf8(bytes) {
        Ok(s) => (s.to_string(), false),
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), true),
    }
}
