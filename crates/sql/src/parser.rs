//! Statement parser for the `show ...` / `select ...` dialect.
//!
//! Lexing is delegated to the `sqlparser` tokenizer; this module only walks
//! the token stream and builds [`Statement`] values.

use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use tsdq_common::{Result, TsdqError};

use crate::ast::{
    AggFunc, Expr, Metadata, MetadataType, Query, SelectItem, Statement, TimeRange,
};

/// Parses one statement. Trailing `;` is accepted.
pub fn parse_statement(sql: &str) -> Result<Statement> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| TsdqError::Planning(format!("tokenize '{sql}': {e}")))?;
    let tokens = tokens
        .into_iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();
    let mut parser = StatementParser { tokens, pos: 0 };
    let stmt = parser.statement()?;
    parser.consume_token(&Token::SemiColon);
    if !parser.at_end() {
        return Err(parser.unexpected("end of statement"));
    }
    Ok(stmt)
}

/// Boolean condition before time bounds are split from tag predicates.
enum Cond {
    Tag(Expr),
    Time(TimeBound),
    And(Box<Cond>, Box<Cond>),
    Or(Box<Cond>, Box<Cond>),
    Not(Box<Cond>),
    Paren(Box<Cond>),
}

enum TimeBound {
    /// `time >= t` / `time > t`
    Start(i64),
    /// `time < t` / `time <= t`
    End(i64),
}

struct StatementParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl StatementParser {
    fn statement(&mut self) -> Result<Statement> {
        if self.consume_keyword("show") {
            return self.show().map(Statement::Metadata);
        }
        if self.consume_keyword("select") {
            return self.select().map(Statement::Query);
        }
        Err(self.unexpected("'show' or 'select'"))
    }

    fn show(&mut self) -> Result<Metadata> {
        if self.consume_keyword("databases") {
            let mut md = Metadata::new(MetadataType::Database);
            self.limit_clause(&mut md.limit)?;
            return Ok(md);
        }
        if self.consume_keyword("namespaces") {
            let mut md = Metadata::new(MetadataType::Namespace);
            if self.consume_keyword("where") {
                md.prefix = self.like_prefix("namespace")?;
            }
            self.limit_clause(&mut md.limit)?;
            return Ok(md);
        }
        if self.consume_keyword("metrics") {
            let mut md = Metadata::new(MetadataType::Metric);
            self.on_clause(&mut md.namespace)?;
            if self.consume_keyword("where") {
                md.prefix = self.like_prefix("metric")?;
            }
            self.limit_clause(&mut md.limit)?;
            return Ok(md);
        }
        if self.consume_keyword("fields") {
            let mut md = Metadata::new(MetadataType::Field);
            self.expect_keyword("from")?;
            md.metric_name = self.name()?;
            self.on_clause(&mut md.namespace)?;
            self.limit_clause(&mut md.limit)?;
            return Ok(md);
        }
        if self.consume_keyword("tag") {
            if self.consume_keyword("keys") {
                let mut md = Metadata::new(MetadataType::TagKey);
                self.expect_keyword("from")?;
                md.metric_name = self.name()?;
                self.on_clause(&mut md.namespace)?;
                self.limit_clause(&mut md.limit)?;
                return Ok(md);
            }
            if self.consume_keyword("values") {
                let mut md = Metadata::new(MetadataType::TagValue);
                self.expect_keyword("from")?;
                md.metric_name = self.name()?;
                self.on_clause(&mut md.namespace)?;
                self.expect_keyword("with")?;
                self.expect_keyword("key")?;
                self.expect_token(&Token::Eq)?;
                md.tag_key = self.name()?;
                if self.consume_keyword("where") {
                    let cond = self.or_cond()?;
                    let (expr, _) = split_time(cond)?;
                    md.condition = expr;
                }
                self.limit_clause(&mut md.limit)?;
                return Ok(md);
            }
            return Err(self.unexpected("'keys' or 'values'"));
        }
        Err(TsdqError::Unsupported(format!(
            "show statement near {}",
            self.describe_current()
        )))
    }

    fn select(&mut self) -> Result<Query> {
        let mut items = vec![self.select_item()?];
        while self.consume_token(&Token::Comma) {
            items.push(self.select_item()?);
        }
        self.expect_keyword("from")?;
        let mut query = Query::new(self.name()?);
        query.select = items;
        self.on_clause(&mut query.namespace)?;
        if self.consume_keyword("where") {
            let cond = self.or_cond()?;
            let (expr, range) = split_time(cond)?;
            query.condition = expr;
            query.time_range = range;
        }
        if self.consume_keyword("group") {
            self.expect_keyword("by")?;
            loop {
                if self.peek_keyword("time") && self.peek_token_at(1) == Some(&Token::LParen) {
                    self.pos += 2;
                    query.interval_ms = self.duration_ms()?;
                    self.expect_token(&Token::RParen)?;
                } else {
                    query.group_by.push(self.name()?);
                }
                if !self.consume_token(&Token::Comma) {
                    break;
                }
            }
        }
        self.limit_clause(&mut query.limit)?;
        Ok(query)
    }

    fn select_item(&mut self) -> Result<SelectItem> {
        if self.peek_token() == Some(&Token::Mul) {
            return Err(TsdqError::Unsupported("select *".to_string()));
        }
        let name = self.name()?;
        if !self.consume_token(&Token::LParen) {
            return Ok(SelectItem {
                field: name,
                func: AggFunc::Sum,
            });
        }
        let func = match name.to_ascii_lowercase().as_str() {
            "sum" => AggFunc::Sum,
            "count" => AggFunc::Count,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            other => {
                return Err(TsdqError::Unsupported(format!("aggregate function '{other}'")));
            }
        };
        let field = self.name()?;
        self.expect_token(&Token::RParen)?;
        Ok(SelectItem { field, func })
    }

    fn or_cond(&mut self) -> Result<Cond> {
        let mut left = self.and_cond()?;
        while self.consume_keyword("or") {
            let right = self.and_cond()?;
            left = Cond::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_cond(&mut self) -> Result<Cond> {
        let mut left = self.unary_cond()?;
        while self.consume_keyword("and") {
            let right = self.unary_cond()?;
            left = Cond::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary_cond(&mut self) -> Result<Cond> {
        if self.consume_keyword("not") {
            return Ok(Cond::Not(Box::new(self.unary_cond()?)));
        }
        if self.consume_token(&Token::LParen) {
            let inner = self.or_cond()?;
            self.expect_token(&Token::RParen)?;
            return Ok(Cond::Paren(Box::new(inner)));
        }
        self.predicate()
    }

    fn predicate(&mut self) -> Result<Cond> {
        let key = self.name()?;
        if key.eq_ignore_ascii_case("time") {
            return self.time_bound();
        }
        if self.consume_keyword("like") {
            let pattern = self.string_value()?;
            return Ok(Cond::Tag(Expr::Like { key, pattern }));
        }
        if self.consume_keyword("in") {
            self.expect_token(&Token::LParen)?;
            let mut values = vec![self.string_value()?];
            while self.consume_token(&Token::Comma) {
                values.push(self.string_value()?);
            }
            self.expect_token(&Token::RParen)?;
            return Ok(Cond::Tag(Expr::In { key, values }));
        }
        if self.consume_token(&Token::Neq) {
            let value = self.string_value()?;
            return Ok(Cond::Tag(Expr::Not(Box::new(Expr::Equals { key, value }))));
        }
        self.expect_token(&Token::Eq)?;
        if self.consume_token(&Token::Tilde) {
            let pattern = self.string_value()?;
            return Ok(Cond::Tag(Expr::Regex { key, pattern }));
        }
        let value = self.string_value()?;
        Ok(Cond::Tag(Expr::Equals { key, value }))
    }

    fn time_bound(&mut self) -> Result<Cond> {
        let token = self.next_token().cloned();
        let ts = self.integer()?;
        match token {
            Some(Token::Gt) => Ok(Cond::Time(TimeBound::Start(ts.saturating_add(1)))),
            Some(Token::GtEq) => Ok(Cond::Time(TimeBound::Start(ts))),
            Some(Token::Lt) => Ok(Cond::Time(TimeBound::End(ts))),
            Some(Token::LtEq) => Ok(Cond::Time(TimeBound::End(ts.saturating_add(1)))),
            _ => Err(TsdqError::Planning(
                "time condition must use one of >, >=, <, <=".to_string(),
            )),
        }
    }

    fn like_prefix(&mut self, key: &str) -> Result<String> {
        self.expect_keyword(key)?;
        if self.consume_token(&Token::Eq) {
            return self.string_value();
        }
        self.expect_keyword("like")?;
        let pattern = self.string_value()?;
        Ok(pattern.trim_end_matches('*').to_string())
    }

    fn on_clause(&mut self, namespace: &mut String) -> Result<()> {
        if self.consume_keyword("on") {
            *namespace = self.name()?;
        }
        Ok(())
    }

    fn limit_clause(&mut self, limit: &mut usize) -> Result<()> {
        if self.consume_keyword("limit") {
            let n = self.integer()?;
            *limit = usize::try_from(n)
                .map_err(|_| TsdqError::Planning(format!("invalid limit {n}")))?;
        }
        Ok(())
    }

    /// Identifier, quoted name, or dotted path such as `system.cpu.load`.
    fn name(&mut self) -> Result<String> {
        let mut out = match self.next_token() {
            Some(Token::Word(w)) => w.value.clone(),
            Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) => s.clone(),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.unexpected("a name"));
            }
        };
        while self.peek_token() == Some(&Token::Period) {
            self.pos += 1;
            match self.next_token() {
                Some(Token::Word(w)) => {
                    out.push('.');
                    out.push_str(&w.value);
                }
                _ => return Err(TsdqError::Planning(format!("dangling '.' after '{out}'"))),
            }
        }
        Ok(out)
    }

    fn string_value(&mut self) -> Result<String> {
        match self.next_token() {
            Some(Token::SingleQuotedString(s)) | Some(Token::DoubleQuotedString(s)) => {
                Ok(s.clone())
            }
            Some(Token::Word(w)) => Ok(w.value.clone()),
            Some(Token::Number(n, _)) => Ok(n.clone()),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("a quoted value"))
            }
        }
    }

    fn integer(&mut self) -> Result<i64> {
        let negative = self.consume_token(&Token::Minus);
        match self.next_token() {
            Some(Token::Number(n, _)) => {
                let v = n
                    .parse::<i64>()
                    .map_err(|e| TsdqError::Planning(format!("invalid integer '{n}': {e}")))?;
                Ok(if negative { -v } else { v })
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("an integer"))
            }
        }
    }

    /// `10s`, `5m`, `1h`, `500ms` or a bare millisecond count.
    fn duration_ms(&mut self) -> Result<i64> {
        let (digits, unit) = match self.next_token() {
            Some(Token::Number(n, _)) => {
                let n = n.clone();
                let unit = match self.peek_token() {
                    Some(Token::Word(w)) => {
                        let u = w.value.to_ascii_lowercase();
                        self.pos += 1;
                        u
                    }
                    _ => "ms".to_string(),
                };
                (n, unit)
            }
            Some(Token::Word(w)) => {
                let split = w
                    .value
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(w.value.len());
                (
                    w.value[..split].to_string(),
                    w.value[split..].to_ascii_lowercase(),
                )
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return Err(self.unexpected("an interval"));
            }
        };
        let n = digits
            .parse::<i64>()
            .map_err(|e| TsdqError::Planning(format!("invalid interval '{digits}': {e}")))?;
        let scale = match unit.as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => return Err(TsdqError::Planning(format!("unknown interval unit '{other}'"))),
        };
        Ok(n * scale)
    }

    fn peek_token(&self) -> Option<&Token> {
        self.peek_token_at(0)
    }

    fn peek_token_at(&self, offset: usize) -> Option<&Token> {
        match self.tokens.get(self.pos + offset) {
            Some(Token::EOF) | None => None,
            Some(t) => Some(t),
        }
    }

    fn next_token(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos).filter(|t| !matches!(t, Token::EOF));
        self.pos += 1;
        t
    }

    fn at_end(&self) -> bool {
        self.peek_token().is_none()
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek_token(), Some(Token::Word(w)) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(kw))
    }

    fn consume_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        if self.consume_keyword(kw) {
            return Ok(());
        }
        Err(self.unexpected(&format!("'{kw}'")))
    }

    fn consume_token(&mut self, token: &Token) -> bool {
        if self.peek_token() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect_token(&mut self, token: &Token) -> Result<()> {
        if self.consume_token(token) {
            return Ok(());
        }
        Err(self.unexpected(&format!("'{token}'")))
    }

    fn describe_current(&self) -> String {
        match self.peek_token() {
            Some(t) => format!("'{t}'"),
            None => "end of input".to_string(),
        }
    }

    fn unexpected(&self, expected: &str) -> TsdqError {
        TsdqError::Planning(format!(
            "expected {expected}, found {}",
            self.describe_current()
        ))
    }
}

/// Separates top-level `time` bounds from the tag filter. Time bounds may
/// only be joined with `and` at the top level.
fn split_time(cond: Cond) -> Result<(Option<Expr>, TimeRange)> {
    let mut range = TimeRange::default();
    let expr = strip_time(cond, &mut range, true)?;
    Ok((expr, range))
}

fn strip_time(cond: Cond, range: &mut TimeRange, top_level: bool) -> Result<Option<Expr>> {
    match cond {
        Cond::Time(bound) => {
            if !top_level {
                return Err(TsdqError::Planning(
                    "time condition cannot be nested under 'or'/'not'".to_string(),
                ));
            }
            match bound {
                TimeBound::Start(t) => range.start = range.start.max(t),
                TimeBound::End(t) => range.end = range.end.min(t),
            }
            Ok(None)
        }
        Cond::Tag(expr) => Ok(Some(expr)),
        Cond::And(l, r) => {
            let l = strip_time(*l, range, top_level)?;
            let r = strip_time(*r, range, top_level)?;
            Ok(match (l, r) {
                (Some(l), Some(r)) => Some(Expr::and(l, r)),
                (one, None) | (None, one) => one,
            })
        }
        Cond::Or(l, r) => {
            let l = strip_time(*l, range, false)?;
            let r = strip_time(*r, range, false)?;
            match (l, r) {
                (Some(l), Some(r)) => Ok(Some(Expr::or(l, r))),
                _ => Err(TsdqError::Planning("empty operand of 'or'".to_string())),
            }
        }
        Cond::Not(inner) => match strip_time(*inner, range, false)? {
            Some(e) => Ok(Some(Expr::Not(Box::new(e)))),
            None => Err(TsdqError::Planning("empty operand of 'not'".to_string())),
        },
        Cond::Paren(inner) => Ok(strip_time(*inner, range, top_level)?.map(|e| Expr::Paren(Box::new(e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, DEFAULT_METADATA_LIMIT, DEFAULT_NAMESPACE};

    fn metadata(sql: &str) -> Metadata {
        match parse_statement(sql).expect("parse") {
            Statement::Metadata(md) => md,
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    fn query(sql: &str) -> Query {
        match parse_statement(sql).expect("parse") {
            Statement::Query(q) => q,
            other => panic!("expected query, got {other:?}"),
        }
    }

    #[test]
    fn parses_show_databases() {
        let md = metadata("show databases");
        assert_eq!(md.metadata_type, MetadataType::Database);
        assert_eq!(md.limit, DEFAULT_METADATA_LIMIT);
    }

    #[test]
    fn parses_show_metrics_with_prefix_and_limit() {
        let md = metadata("SHOW METRICS ON 'ns1' WHERE metric LIKE 'cpu*' LIMIT 10;");
        assert_eq!(md.metadata_type, MetadataType::Metric);
        assert_eq!(md.namespace, "ns1");
        assert_eq!(md.prefix, "cpu");
        assert_eq!(md.limit, 10);
    }

    #[test]
    fn parses_show_tag_values_with_condition() {
        let md = metadata(
            "show tag values from cpu with key = host where region = 'sh' and zone != 'a' limit 2",
        );
        assert_eq!(md.metadata_type, MetadataType::TagValue);
        assert_eq!(md.namespace, DEFAULT_NAMESPACE);
        assert_eq!(md.metric_name, "cpu");
        assert_eq!(md.tag_key, "host");
        assert_eq!(md.limit, 2);
        match md.condition.expect("condition") {
            Expr::Binary { op, left, right } => {
                assert_eq!(op, BinaryOp::And);
                assert_eq!(*left, Expr::equals("region", "sh"));
                assert_eq!(*right, Expr::Not(Box::new(Expr::equals("zone", "a"))));
            }
            other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn parses_show_fields_and_tag_keys() {
        let md = metadata("show fields from system.cpu.load");
        assert_eq!(md.metadata_type, MetadataType::Field);
        assert_eq!(md.metric_name, "system.cpu.load");

        let md = metadata("show tag keys from cpu on ns limit 3");
        assert_eq!(md.metadata_type, MetadataType::TagKey);
        assert_eq!(md.namespace, "ns");
        assert_eq!(md.limit, 3);
    }

    #[test]
    fn parses_select_with_group_by_and_time() {
        let q = query(
            "select sum(usage), max(load) from cpu where host in ('a','b') and time >= 1000 and time < 5000 group by host, time(10s) limit 5",
        );
        assert_eq!(q.metric_name, "cpu");
        assert_eq!(q.select.len(), 2);
        assert_eq!(q.select[1].func, AggFunc::Max);
        assert_eq!(q.group_by, vec!["host".to_string()]);
        assert_eq!(q.interval_ms, 10_000);
        assert_eq!(q.time_range, TimeRange { start: 1000, end: 5000 });
        assert_eq!(q.limit, 5);
        assert!(matches!(q.condition, Some(Expr::In { .. })));
    }

    #[test]
    fn parses_plain_select() {
        let q = query("select f from cpu");
        assert!(!q.has_group_by());
        assert_eq!(q.field_names(), vec!["f"]);
        assert_eq!(q.select[0].func, AggFunc::Sum);
        assert!(q.condition.is_none());
    }

    #[test]
    fn parses_regex_and_parens() {
        let q = query("select f from cpu where not (host =~ 'db.*' or zone like 'a*')");
        match q.condition.expect("condition") {
            Expr::Not(inner) => assert!(matches!(*inner, Expr::Paren(_))),
            other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn rejects_time_under_or() {
        let err = parse_statement("select f from cpu where host = 'a' or time > 10")
            .expect_err("must fail");
        assert!(err.to_string().contains("time condition"));
    }

    #[test]
    fn rejects_unknown_statements() {
        assert!(parse_statement("drop table cpu").is_err());
        assert!(parse_statement("show tag cpu").is_err());
        assert!(parse_statement("select f from cpu garbage").is_err());
    }
}
