use regex::Regex;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// stderr 保留的最近行数
pub const STDERR_TAIL_LINES: usize = 60;
/// 错误行保留数量
pub const ERROR_LINES: usize = 30;

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:frame|size)=.*\btime=").expect("static regex"))
}

fn error_keyword_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)error|failed|invalid|unable|cannot|refused|timeout").expect("static regex")
    })
}

/// 进度行 (`frame=... size=... time=... speed=...`)
pub fn is_progress_line(line: &str) -> bool {
    progress_regex().is_match(line)
}

/// 含失败关键字且不是进度行
pub fn is_error_line(line: &str) -> bool {
    !is_progress_line(line) && error_keyword_regex().is_match(line)
}

fn push_bounded(buf: &mut VecDeque<String>, line: &str, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(line.to_string());
}

/// 单个 FFmpeg 进程的 stderr 记录
#[derive(Debug, Default)]
pub struct DiagnosticLog {
    tail: VecDeque<String>,
    errors: VecDeque<String>,
    closed: bool,
}

impl DiagnosticLog {
    /// 记录一行，返回是否为错误行
    pub fn record(&mut self, line: &str) -> bool {
        push_bounded(&mut self.tail, line, STDERR_TAIL_LINES);
        if is_error_line(line) {
            push_bounded(&mut self.errors, line, ERROR_LINES);
            true
        } else {
            false
        }
    }

    /// stderr 已读到 EOF
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.errors.iter().cloned().collect()
    }

    pub fn last_lines(&self, n: usize) -> Vec<String> {
        let skip = self.tail.len().saturating_sub(n);
        self.tail.iter().skip(skip).cloned().collect()
    }

    /// 最能说明失败原因的一行：优先最后一条错误行，否则取最后一行输出
    pub fn last_text(&self) -> Option<String> {
        self.errors.back().or_else(|| self.tail.back()).cloned()
    }
}
