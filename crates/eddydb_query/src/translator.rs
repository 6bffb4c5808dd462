//! The query-to-SQL translator.
//!
//! Single-pass over the AST, except for a pre-pass that collects MATCH
//! properties: their FTS tables must appear in the FROM list before they
//! are joined in WHERE.

use crate::error::{QueryError, QueryResult};
use crate::value::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use tracing::warn;

/// The translator's output: SQL text plus the named parameters it
/// references (each emitted as `$_name` in the SQL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    /// The generated SQL.
    pub sql: String,
    /// Names of `$`-parameters referenced by the query.
    pub parameters: BTreeSet<String>,
}

/// Translates a query AST into SQL over `table_name`, reading document
/// properties from `body_column`.
///
/// # Errors
///
/// Returns [`QueryError::InvalidQuery`] for malformed ASTs: wrong arity,
/// unknown operators, malformed paths, variable reuse, dictionaries
/// outside `SELECT`, binary literals, non-property MATCH sources,
/// `rank()` without an FTS property, and bad parameter names.
pub fn translate(query: &Value, table_name: &str, body_column: &str) -> QueryResult<Translation> {
    let mut translator = Translator::new(table_name, body_column);
    translator.parse(query)?;
    Ok(translator.finish())
}

/// Translates a bare expression (no SELECT wrapper, no FTS pre-pass).
///
/// # Errors
///
/// Same failure modes as [`translate`].
pub fn translate_expression(
    expression: &Value,
    table_name: &str,
    body_column: &str,
) -> QueryResult<Translation> {
    let mut translator = Translator::new(table_name, body_column);
    translator.parse_node(expression)?;
    Ok(translator.finish())
}

/// Produces a standalone property-getter SQL fragment for `property`,
/// reading from `body_column`.
///
/// # Errors
///
/// Fails for properties that are not legal under `fl_value`.
pub fn property_getter(property: &str, body_column: &str) -> QueryResult<String> {
    let mut translator = Translator::new("", body_column);
    translator.write_property_getter("fl_value", property)?;
    Ok(translator.sql)
}

/// How an operator is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    /// Property path accessor (`.`).
    Property,
    /// Named query parameter (`$`).
    Parameter,
    /// Quantifier-variable reference (`?`).
    Variable,
    /// Binary/variadic infix operator.
    Infix,
    /// Unary prefix operator.
    Prefix,
    /// Unary postfix operator (`DESC`).
    Postfix,
    /// `IN` / `NOT IN`.
    InOp,
    /// Full-text `MATCH`.
    Match,
    /// `BETWEEN x AND y`.
    Between,
    /// `EXISTS` (property form becomes `fl_exists`).
    Exists,
    /// `ANY` / `EVERY` / `ANY AND EVERY` quantifiers.
    AnyEvery,
    /// Nested `SELECT`.
    Select,
    /// Unrecognized operator: property/parameter shorthand or function
    /// call.
    Fallback,
}

/// One entry of the operator table.
#[derive(Debug)]
struct Operation {
    name: &'static str,
    min_args: usize,
    max_args: usize,
    precedence: i32,
    kind: OpKind,
}

/// The operator table. Order matters: the unary `-` entry follows the
/// binary one, and the fallback entry comes last.
static OPERATIONS: &[Operation] = &[
    Operation { name: ".", min_args: 1, max_args: 9, precedence: 9, kind: OpKind::Property },
    Operation { name: "$", min_args: 1, max_args: 1, precedence: 9, kind: OpKind::Parameter },
    Operation { name: "?", min_args: 1, max_args: 9, precedence: 9, kind: OpKind::Variable },
    Operation { name: "||", min_args: 2, max_args: 9, precedence: 8, kind: OpKind::Infix },
    Operation { name: "*", min_args: 2, max_args: 9, precedence: 7, kind: OpKind::Infix },
    Operation { name: "/", min_args: 2, max_args: 2, precedence: 7, kind: OpKind::Infix },
    Operation { name: "%", min_args: 2, max_args: 2, precedence: 7, kind: OpKind::Infix },
    Operation { name: "+", min_args: 2, max_args: 9, precedence: 6, kind: OpKind::Infix },
    Operation { name: "-", min_args: 2, max_args: 2, precedence: 6, kind: OpKind::Infix },
    Operation { name: "-", min_args: 1, max_args: 1, precedence: 9, kind: OpKind::Prefix },
    Operation { name: "<", min_args: 2, max_args: 2, precedence: 4, kind: OpKind::Infix },
    Operation { name: "<=", min_args: 2, max_args: 2, precedence: 4, kind: OpKind::Infix },
    Operation { name: ">", min_args: 2, max_args: 2, precedence: 4, kind: OpKind::Infix },
    Operation { name: ">=", min_args: 2, max_args: 2, precedence: 4, kind: OpKind::Infix },
    Operation { name: "=", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Infix },
    Operation { name: "!=", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Infix },
    Operation { name: "IS", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Infix },
    Operation { name: "IS NOT", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Infix },
    Operation { name: "IN", min_args: 2, max_args: 9, precedence: 3, kind: OpKind::InOp },
    Operation { name: "NOT IN", min_args: 2, max_args: 9, precedence: 3, kind: OpKind::InOp },
    Operation { name: "LIKE", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Infix },
    Operation { name: "MATCH", min_args: 2, max_args: 2, precedence: 3, kind: OpKind::Match },
    Operation { name: "BETWEEN", min_args: 3, max_args: 3, precedence: 3, kind: OpKind::Between },
    Operation { name: "EXISTS", min_args: 1, max_args: 1, precedence: 8, kind: OpKind::Exists },
    Operation { name: "NOT", min_args: 1, max_args: 1, precedence: 9, kind: OpKind::Prefix },
    Operation { name: "AND", min_args: 2, max_args: 9, precedence: 2, kind: OpKind::Infix },
    Operation { name: "OR", min_args: 2, max_args: 9, precedence: 2, kind: OpKind::Infix },
    Operation { name: "ANY", min_args: 3, max_args: 3, precedence: 1, kind: OpKind::AnyEvery },
    Operation { name: "EVERY", min_args: 3, max_args: 3, precedence: 1, kind: OpKind::AnyEvery },
    Operation { name: "ANY AND EVERY", min_args: 3, max_args: 3, precedence: 1, kind: OpKind::AnyEvery },
    Operation { name: "SELECT", min_args: 1, max_args: 1, precedence: 1, kind: OpKind::Select },
    Operation { name: "DESC", min_args: 1, max_args: 1, precedence: 2, kind: OpKind::Postfix },
];

/// Fallback for unrecognized operators; always last in lookup order.
static FALLBACK_OP: Operation = Operation {
    name: "",
    min_args: 0,
    max_args: 9,
    precedence: 10,
    kind: OpKind::Fallback,
};

/// Argument lists are written under this sentinel so they always
/// parenthesize.
static ARG_LIST_OP: Operation = Operation {
    name: ",",
    min_args: 0,
    max_args: 9,
    precedence: -2,
    kind: OpKind::Infix,
};

/// ORDER BY suppresses the argument list's outer parentheses.
static ORDER_BY_OP: Operation = Operation {
    name: "ORDER BY",
    min_args: 1,
    max_args: 9,
    precedence: -3,
    kind: OpKind::Infix,
};

/// The outermost context.
static OUTER_OP: Operation = Operation {
    name: "",
    min_args: 1,
    max_args: 1,
    precedence: -1,
    kind: OpKind::Infix,
};

/// SELECT operand keys that are recognized but not yet defined; they are
/// rejected rather than silently ignored. The leading-space form is a
/// legacy artifact.
const RESERVED_SELECT_KEYS: &[&str] = &["WHAT", "FROM", " FROM", "GROUP BY", "HAVING"];

fn fail<T>(message: impl Into<String>) -> QueryResult<T> {
    let message = message.into();
    warn!("invalid query: {message}");
    Err(QueryError::InvalidQuery(message))
}

fn is_alphanumeric_or_underscore(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn is_valid_identifier(s: &str) -> bool {
    is_alphanumeric_or_underscore(s) && !s.as_bytes()[0].is_ascii_digit()
}

struct Translator<'a> {
    table_name: &'a str,
    body_column: &'a str,
    sql: String,
    context: Vec<&'static Operation>,
    parameters: BTreeSet<String>,
    variables: BTreeSet<String>,
    fts_properties: Vec<String>,
}

impl<'a> Translator<'a> {
    fn new(table_name: &'a str, body_column: &'a str) -> Self {
        Self {
            table_name,
            body_column,
            sql: String::new(),
            context: vec![&OUTER_OP],
            parameters: BTreeSet::new(),
            variables: BTreeSet::new(),
            fts_properties: Vec::new(),
        }
    }

    fn finish(self) -> Translation {
        Translation {
            sql: self.sql,
            parameters: self.parameters,
        }
    }

    fn parse(&mut self, query: &Value) -> QueryResult<()> {
        if query.as_dict().is_some() {
            // A bare dict is the operand set of an implicit SELECT.
            return self.write_select_dict(query);
        }
        if let Some(items) = query.as_array() {
            if items.first().and_then(Value::as_str) == Some("SELECT") {
                return self.parse_node(query);
            }
        }
        // Some other expression: treat it as an implicit WHERE clause.
        self.write_select(Some(query), None)
    }

    fn write_select_dict(&mut self, operands: &Value) -> QueryResult<()> {
        self.write_select(operands.get("WHERE"), Some(operands))
    }

    fn write_select(&mut self, where_: Option<&Value>, operands: Option<&Value>) -> QueryResult<()> {
        if let Some(operands) = operands {
            for key in RESERVED_SELECT_KEYS {
                if operands.get(key).is_some() {
                    return fail(format!("{} parameter to SELECT isn't supported", key.trim()));
                }
            }
        }

        // All MATCH properties must be known before FROM is written.
        if let Some(where_) = where_ {
            self.find_fts_properties(where_);
        }

        self.sql.push_str("SELECT ");
        let _ = write!(self.sql, "{}.*", self.table_name);
        for property in &self.fts_properties {
            let _ = write!(self.sql, ", offsets(\"{}::{}\")", self.table_name, property);
        }

        let _ = write!(self.sql, " FROM {}", self.table_name);
        for (i, property) in self.fts_properties.iter().enumerate() {
            let _ = write!(
                self.sql,
                ", \"{}::{}\" AS FTS{}",
                self.table_name,
                property,
                i + 1
            );
        }

        if let Some(where_) = where_ {
            self.sql.push_str(" WHERE ");
            self.parse_node(where_)?;
        }

        if let Some(order) = operands.and_then(|ops| ops.get("ORDER BY")) {
            self.sql.push_str(" ORDER BY ");
            let Some(order_bys) = order.as_array() else {
                return fail("ORDER BY must be an array");
            };
            self.context.push(&ORDER_BY_OP);
            let result = self.write_arg_list(order_bys);
            self.context.pop();
            result?;
        }
        Ok(())
    }

    fn parse_node(&mut self, node: &Value) -> QueryResult<()> {
        match node {
            Value::Null => self.sql.push_str("NULL"),
            Value::Bool(b) => self.sql.push(if *b { '1' } else { '0' }),
            Value::Int(i) => {
                let _ = write!(self.sql, "{i}");
            }
            Value::Float(f) => {
                let _ = write!(self.sql, "{f}");
            }
            Value::String(s) => write_sql_string(&mut self.sql, s),
            Value::Bytes(_) => return fail("binary data not supported in query"),
            Value::Array(_) => return self.parse_op_node(node),
            Value::Dict(_) => return fail("dictionaries only allowed as SELECT operands"),
        }
        Ok(())
    }

    fn parse_op_node(&mut self, node: &Value) -> QueryResult<()> {
        let items = node.as_array().expect("caller checked");
        let Some(first) = items.first() else {
            return fail("empty JSON array");
        };
        let Some(op) = first.as_str() else {
            return fail("operation must be a string");
        };
        let args = &items[1..];
        let nargs = args.len().min(9);

        let mut name_matched = false;
        let mut chosen: Option<&'static Operation> = None;
        for def in OPERATIONS {
            if def.name == op {
                name_matched = true;
                if nargs >= def.min_args && nargs <= def.max_args {
                    chosen = Some(def);
                    break;
                }
            }
        }
        match chosen {
            Some(def) => self.handle_operation(def, op, args),
            None if name_matched => fail(format!("wrong number of arguments to {op}")),
            None => self.handle_operation(&FALLBACK_OP, op, args),
        }
    }

    /// Pushes the operation on the context stack and parenthesizes if its
    /// precedence does not exceed the enclosing operation's.
    fn handle_operation(
        &mut self,
        def: &'static Operation,
        op: &str,
        args: &[Value],
    ) -> QueryResult<()> {
        let enclosing = self.context.last().expect("context never empty");
        let parenthesize = def.precedence <= enclosing.precedence;
        self.context.push(def);
        if parenthesize {
            self.sql.push('(');
        }

        let result = match def.kind {
            OpKind::Property => self.property_op(args),
            OpKind::Parameter => self.parameter_op(op, args),
            OpKind::Variable => self.variable_op(args),
            OpKind::Infix => self.infix_op(op, args),
            OpKind::Prefix => self.prefix_op(op, args),
            OpKind::Postfix => self.postfix_op(op, args),
            OpKind::InOp => self.in_op(op, args),
            OpKind::Match => self.match_op(args),
            OpKind::Between => self.between_op(op, args),
            OpKind::Exists => self.exists_op(op, args),
            OpKind::AnyEvery => self.any_every_op(op, args),
            OpKind::Select => self.select_op(args),
            OpKind::Fallback => self.fallback_op(op, args),
        };

        if parenthesize {
            self.sql.push(')');
        }
        self.context.pop();
        result
    }

    fn prefix_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        self.sql.push_str(op);
        if op.ends_with(|c: char| c.is_ascii_alphabetic()) {
            self.sql.push(' ');
        }
        self.parse_node(&args[0])
    }

    fn postfix_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        self.parse_node(&args[0])?;
        self.sql.push(' ');
        self.sql.push_str(op);
        Ok(())
    }

    fn infix_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                if op != "," {
                    self.sql.push(' ');
                }
                self.sql.push_str(op);
                self.sql.push(' ');
            }
            self.parse_node(arg)?;
        }
        Ok(())
    }

    fn exists_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        // "EXISTS property" becomes a call to fl_exists().
        if self.write_nested_property_op_if_any("fl_exists", args)? {
            return Ok(());
        }
        self.sql.push_str(op);
        self.sql.push(' ');
        self.parse_node(&args[0])
    }

    fn between_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        self.parse_node(&args[0])?;
        let _ = write!(self.sql, " {op} ");
        self.parse_node(&args[1])?;
        self.sql.push_str(" AND ");
        self.parse_node(&args[2])
    }

    fn in_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        self.parse_node(&args[0])?;
        let _ = write!(self.sql, " {op} ");
        self.write_arg_list(&args[1..])
    }

    fn match_op(&mut self, args: &[Value]) -> QueryResult<()> {
        let Some(property) = property_from_node(&args[0])? else {
            return fail("source of MATCH must be a property");
        };
        // Implicit join against the FTS table registered in the pre-pass.
        let fts_table = self.add_fts_property(&property);
        let _ = write!(self.sql, "(FTS{fts_table}.text MATCH ");
        self.parse_node(&args[1])?;
        let _ = write!(
            self.sql,
            " AND FTS{fts_table}.rowid = {}.sequence)",
            self.table_name
        );
        Ok(())
    }

    fn any_every_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        let Some(var) = args[0].as_str() else {
            return fail("ANY/EVERY first parameter must be an identifier");
        };
        if !is_valid_identifier(var) {
            return fail("ANY/EVERY first parameter must be an identifier");
        }
        if self.variables.contains(var) {
            return fail(format!("variable '{var}' is already in use"));
        }
        self.variables.insert(var.to_owned());

        let Some(property) = property_from_node(&args[1])? else {
            return fail("ANY/EVERY only supports a property as its source");
        };

        let every = op != "ANY";
        let any_and_every = op == "ANY AND EVERY";

        if any_and_every {
            self.sql.push('(');
            self.write_property_getter("fl_count", &property)?;
            self.sql.push_str(" > 0 AND ");
        }
        if every {
            self.sql.push_str("NOT ");
        }
        self.sql.push_str("EXISTS (SELECT 1 FROM ");
        self.write_property_getter("fl_each", &property)?;
        let _ = write!(self.sql, " AS _{var} WHERE ");
        if every {
            self.sql.push_str("NOT (");
        }
        self.parse_node(&args[2])?;
        if every {
            self.sql.push(')');
        }
        self.sql.push(')');
        if any_and_every {
            self.sql.push(')');
        }

        self.variables.remove(var);
        Ok(())
    }

    fn property_op(&mut self, args: &[Value]) -> QueryResult<()> {
        let property = property_from_operands(args)?;
        self.write_property_getter("fl_value", &property)
    }

    fn parameter_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        let name = if op == "$" {
            match &args[0] {
                Value::String(s) => s.clone(),
                Value::Int(i) => i.to_string(),
                _ => return fail("invalid query parameter name"),
            }
        } else {
            // "$name" shorthand via the fallback path.
            if !args.is_empty() {
                return fail(format!("extra operands to {}", &op[1..]));
            }
            op[1..].to_owned()
        };
        if !is_alphanumeric_or_underscore(&name) {
            return fail("invalid query parameter name");
        }
        let _ = write!(self.sql, "$_{name}");
        self.parameters.insert(name);
        Ok(())
    }

    fn variable_op(&mut self, args: &[Value]) -> QueryResult<()> {
        let Some(var) = args[0].as_str() else {
            return fail("invalid variable name");
        };
        if !is_valid_identifier(var) {
            return fail("invalid variable name");
        }
        if !self.variables.contains(var) {
            return fail(format!("no such variable '{var}'"));
        }
        if args.len() == 1 {
            let _ = write!(self.sql, "_{var}.value");
        } else {
            let property = property_from_operands(&args[1..])?;
            let _ = write!(self.sql, "fl_value(_{var}.pointer, ");
            write_sql_string(&mut self.sql, &property);
            self.sql.push(')');
        }
        Ok(())
    }

    fn select_op(&mut self, args: &[Value]) -> QueryResult<()> {
        if args[0].as_dict().is_none() {
            return fail("argument to SELECT must be an object");
        }
        if self.context.len() <= 2 {
            // Outer SELECT.
            self.write_select_dict(&args[0])
        } else {
            // Nested SELECT; use a fresh translator.
            let mut nested = Translator::new(self.table_name, self.body_column);
            nested.parse(&args[0])?;
            self.sql.push_str(&nested.sql);
            self.parameters.extend(nested.parameters);
            Ok(())
        }
    }

    /// Unrecognized operator: `.path` and `$name` shorthands, or a
    /// function call when the name ends in `()`.
    fn fallback_op(&mut self, op: &str, args: &[Value]) -> QueryResult<()> {
        if let Some(path) = op.strip_prefix('.') {
            self.write_property_getter("fl_value", path)
        } else if op.starts_with('$') {
            self.parameter_op(op, args)
        } else if op.len() > 2 && op.ends_with("()") {
            self.function_op(&op[..op.len() - 2], args)
        } else {
            fail(format!("unknown operator: {op}"))
        }
    }

    fn function_op(&mut self, name: &str, args: &[Value]) -> QueryResult<()> {
        // count(property) and rank(property) shortcuts.
        if name == "count" && self.write_nested_property_op_if_any("fl_count", args)? {
            return Ok(());
        }
        if name == "rank" && self.write_nested_property_op_if_any("rank", args)? {
            return Ok(());
        }
        self.sql.push_str(name);
        self.write_arg_list(args)
    }

    /// Writes operands as a comma-separated list, parenthesized depending
    /// on the current precedence.
    fn write_arg_list(&mut self, args: &[Value]) -> QueryResult<()> {
        self.handle_operation(&ARG_LIST_OP, ",", args)
    }

    /// If the first operand is a property, writes it with the given SQL
    /// function and returns true.
    fn write_nested_property_op_if_any(
        &mut self,
        fn_name: &str,
        args: &[Value],
    ) -> QueryResult<bool> {
        let Some(first) = args.first() else {
            return Ok(false);
        };
        let Some(property) = property_from_node(first)? else {
            return Ok(false);
        };
        self.write_property_getter(fn_name, &property)?;
        Ok(true)
    }

    /// Writes a call to a document-accessor SQL function, including the
    /// closing parenthesis.
    fn write_property_getter(&mut self, fn_name: &str, property: &str) -> QueryResult<()> {
        match property {
            "_id" => {
                if fn_name != "fl_value" {
                    return fail("can't use '_id' in this context");
                }
                self.sql.push_str("key");
            }
            "_sequence" => {
                if fn_name != "fl_value" {
                    return fail("can't use '_sequence' in this context");
                }
                self.sql.push_str("sequence");
            }
            _ if fn_name == "rank" => {
                if self.fts_property_index(property) == 0 {
                    return fail("rank() can only be used with FTS properties");
                }
                let _ = write!(
                    self.sql,
                    "rank(matchinfo(\"{}::{}\"))",
                    self.table_name, property
                );
            }
            _ => {
                let _ = write!(self.sql, "{fn_name}({}, ", self.body_column);
                write_sql_string(&mut self.sql, property);
                self.sql.push(')');
            }
        }
        Ok(())
    }

    /// Pre-pass: collects MATCH properties so the FROM list can name
    /// their FTS tables before WHERE joins them.
    fn find_fts_properties(&mut self, node: &Value) {
        let Some(items) = node.as_array() else { return };
        let mut rest = items.get(1..).unwrap_or(&[]);
        if items.first().and_then(Value::as_str) == Some("MATCH") {
            if let Some(first) = rest.first() {
                if let Ok(Some(property)) = property_from_node(first) {
                    self.add_fts_property(&property);
                }
            }
            rest = rest.get(1..).unwrap_or(&[]);
        }
        for operand in rest {
            self.find_fts_properties(operand);
        }
    }

    /// 1-based index of an already-registered FTS property, or 0.
    fn fts_property_index(&self, property: &str) -> usize {
        self.fts_properties
            .iter()
            .position(|p| p == property)
            .map_or(0, |i| i + 1)
    }

    /// Registers an FTS property (deduplicated) and returns its 1-based
    /// table number.
    fn add_fts_property(&mut self, property: &str) -> usize {
        let index = self.fts_property_index(property);
        if index != 0 {
            return index;
        }
        self.fts_properties.push(property.to_owned());
        self.fts_properties.len()
    }
}

/// Writes a string with SQL quoting: wrapped in apostrophes, internal
/// apostrophes doubled.
fn write_sql_string(sql: &mut String, s: &str) {
    sql.push('\'');
    for c in s.chars() {
        if c == '\'' {
            sql.push_str("''");
        } else {
            sql.push(c);
        }
    }
    sql.push('\'');
}

/// Concatenates property operands into a path string:
/// `["a", "b", [2], "c"]` becomes `a.b[2].c`.
fn property_from_operands(operands: &[Value]) -> QueryResult<String> {
    let mut property = String::new();
    for (n, operand) in operands.iter().enumerate() {
        if let Some(index_items) = operand.as_array() {
            if n == 0 {
                return fail("property path can't start with an array index");
            }
            if index_items.len() != 1 {
                return fail("property array index must have exactly one item");
            }
            let Some(index) = index_items[0].as_int() else {
                return fail("property array index must be an integer");
            };
            let _ = write!(property, "[{index}]");
        } else {
            let Some(name) = operand.as_str() else {
                return fail("invalid JSON value in property path");
            };
            if n > 0 {
                property.push('.');
            }
            property.push_str(name);
        }
    }
    Ok(property)
}

/// Returns the property path represented by a node, or `None` if the node
/// is not a property expression.
fn property_from_node(node: &Value) -> QueryResult<Option<String>> {
    let Some(items) = node.as_array() else {
        return Ok(None);
    };
    let Some(op) = items.first().and_then(Value::as_str) else {
        return Ok(None);
    };
    if let Some(path) = op.strip_prefix('.') {
        if op == "." {
            return property_from_operands(&items[1..]).map(Some);
        }
        return Ok(Some(path.to_owned()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ast(json: &str) -> Value {
        Value::from_json_str(json).unwrap()
    }

    fn sql_of(json: &str) -> String {
        translate(&ast(json), "docs", "body").unwrap().sql
    }

    fn error_of(json: &str) -> String {
        match translate(&ast(json), "docs", "body") {
            Err(QueryError::InvalidQuery(message)) => message,
            Ok(t) => panic!("expected failure, got {}", t.sql),
        }
    }

    #[test]
    fn implicit_where_select() {
        assert_eq!(
            sql_of(r#"["=", [".", "type"], "person"]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'type') = 'person'"
        );
    }

    #[test]
    fn match_emits_fts_join_and_offsets() {
        assert_eq!(
            sql_of(r#"["AND", ["=", [".", "type"], "person"], ["MATCH", [".", "bio"], "cat"]]"#),
            "SELECT docs.*, offsets(\"docs::bio\") FROM docs, \"docs::bio\" AS FTS1 \
             WHERE fl_value(body, 'type') = 'person' AND \
             (FTS1.text MATCH 'cat' AND FTS1.rowid = docs.sequence)"
        );
    }

    #[test]
    fn property_path_forms_are_equivalent() {
        let split = sql_of(r#"[".", "a", "b", [2], "c"]"#);
        let joined = sql_of(r#"[".a.b[2].c"]"#);
        assert_eq!(split, "SELECT docs.* FROM docs WHERE fl_value(body, 'a.b[2].c')");
        assert_eq!(split, joined);
    }

    #[test]
    fn meta_properties_translate_to_columns() {
        assert_eq!(
            sql_of(r#"["=", ["._id"], "doc1"]"#),
            "SELECT docs.* FROM docs WHERE key = 'doc1'"
        );
        assert_eq!(
            sql_of(r#"[">", ["._sequence"], 7]"#),
            "SELECT docs.* FROM docs WHERE sequence > 7"
        );
        assert!(error_of(r#"["EXISTS", ["._id"]]"#).contains("_id"));
    }

    #[test]
    fn parameters_are_recorded_and_prefixed() {
        let t = translate(
            &ast(r#"["AND", ["=", [".", "a"], ["$", "min"]], ["=", [".", "b"], ["$limit"]]]"#),
            "docs",
            "body",
        )
        .unwrap();
        assert!(t.sql.contains("$_min"));
        assert!(t.sql.contains("$_limit"));
        assert_eq!(
            t.parameters.into_iter().collect::<Vec<_>>(),
            vec!["limit".to_owned(), "min".to_owned()]
        );
    }

    #[test]
    fn bad_parameter_name_is_rejected() {
        assert!(error_of(r#"["$", "no-dashes"]"#).contains("parameter"));
    }

    #[test]
    fn quantifiers_expand_to_exists() {
        assert_eq!(
            sql_of(r#"["ANY", "x", [".", "tags"], ["=", ["?", "x"], "cool"]]"#),
            "SELECT docs.* FROM docs WHERE EXISTS (SELECT 1 FROM fl_each(body, 'tags') \
             AS _x WHERE _x.value = 'cool')"
        );
        assert_eq!(
            sql_of(r#"["EVERY", "x", [".", "tags"], ["=", ["?", "x"], "cool"]]"#),
            "SELECT docs.* FROM docs WHERE NOT EXISTS (SELECT 1 FROM fl_each(body, 'tags') \
             AS _x WHERE NOT (_x.value = 'cool'))"
        );
        assert_eq!(
            sql_of(r#"["ANY AND EVERY", "x", [".", "tags"], ["=", ["?", "x"], "cool"]]"#),
            "SELECT docs.* FROM docs WHERE (fl_count(body, 'tags') > 0 AND \
             NOT EXISTS (SELECT 1 FROM fl_each(body, 'tags') AS _x WHERE NOT (_x.value = 'cool')))"
        );
    }

    #[test]
    fn quantifier_variable_with_path() {
        assert_eq!(
            sql_of(r#"["ANY", "v", [".", "addrs"], ["=", ["?", "v", "zip"], "98101"]]"#),
            "SELECT docs.* FROM docs WHERE EXISTS (SELECT 1 FROM fl_each(body, 'addrs') \
             AS _v WHERE fl_value(_v.pointer, 'zip') = '98101')"
        );
    }

    #[test]
    fn variable_shadowing_and_unknown_variable_fail() {
        assert!(error_of(
            r#"["ANY", "x", [".", "a"], ["ANY", "x", [".", "b"], ["=", ["?", "x"], 1]]]"#
        )
        .contains("already in use"));
        assert!(error_of(r#"["=", ["?", "nope"], 1]"#).contains("no such variable"));
    }

    #[test]
    fn in_and_between_render() {
        assert_eq!(
            sql_of(r#"["IN", [".", "n"], 1, 2, 3]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'n') IN (1, 2, 3)"
        );
        assert_eq!(
            sql_of(r#"["NOT IN", [".", "n"], 1, 2]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'n') NOT IN (1, 2)"
        );
        assert_eq!(
            sql_of(r#"["BETWEEN", [".", "n"], 1, 10]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'n') BETWEEN 1 AND 10"
        );
    }

    #[test]
    fn exists_property_becomes_fl_exists() {
        assert_eq!(
            sql_of(r#"["EXISTS", [".", "name"]]"#),
            "SELECT docs.* FROM docs WHERE fl_exists(body, 'name')"
        );
    }

    #[test]
    fn function_call_shortcuts() {
        assert_eq!(
            sql_of(r#"[">", ["count()", [".", "tags"]], 2]"#),
            "SELECT docs.* FROM docs WHERE fl_count(body, 'tags') > 2"
        );
        assert_eq!(
            sql_of(r#"["AND", ["MATCH", [".", "bio"], "cat"], [">", ["rank()", [".bio"]], 0.5]]"#),
            "SELECT docs.*, offsets(\"docs::bio\") FROM docs, \"docs::bio\" AS FTS1 WHERE \
             (FTS1.text MATCH 'cat' AND FTS1.rowid = docs.sequence) AND \
             rank(matchinfo(\"docs::bio\")) > 0.5"
        );
    }

    #[test]
    fn rank_without_fts_property_fails() {
        assert!(error_of(r#"[">", ["rank()", [".bio"]], 0.5]"#).contains("rank()"));
    }

    #[test]
    fn generic_function_call() {
        assert_eq!(
            sql_of(r#"[">", ["length()", [".", "name"]], 3]"#),
            "SELECT docs.* FROM docs WHERE length(fl_value(body, 'name')) > 3"
        );
    }

    #[test]
    fn literals_render_in_sql_forms() {
        assert_eq!(
            sql_of(r#"["=", [".", "a"], null]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'a') = NULL"
        );
        assert_eq!(
            sql_of(r#"["=", [".", "a"], true]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'a') = 1"
        );
        assert_eq!(
            sql_of(r#"["=", [".", "a"], "it's"]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'a') = 'it''s'"
        );
    }

    #[test]
    fn binary_and_stray_dict_are_rejected() {
        let query = Value::Array(vec![
            Value::String("=".into()),
            Value::Array(vec![Value::String(".".into()), Value::String("a".into())]),
            Value::Bytes(vec![1, 2, 3]),
        ]);
        assert!(matches!(
            translate(&query, "docs", "body"),
            Err(QueryError::InvalidQuery(_))
        ));
        assert!(error_of(r#"["=", [".", "a"], {"x": 1}]"#).contains("dictionaries"));
    }

    #[test]
    fn unknown_operator_and_wrong_arity_fail() {
        assert!(error_of(r#"["FROB", 1]"#).contains("unknown operator"));
        assert!(error_of(r#"["AND", 1]"#).contains("wrong number of arguments"));
        assert!(error_of(r#"["BETWEEN", 1, 2]"#).contains("wrong number of arguments"));
    }

    #[test]
    fn unary_minus_picks_the_prefix_entry() {
        assert_eq!(
            sql_of(r#"["=", [".", "n"], ["-", 5]]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'n') = -5"
        );
        assert_eq!(
            sql_of(r#"["=", [".", "n"], ["-", 9, 5]]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'n') = 9 - 5"
        );
    }

    #[test]
    fn same_precedence_nesting_parenthesizes() {
        assert_eq!(
            sql_of(r#"["AND", ["AND", ["=", [".a"], 1], ["=", [".b"], 2]], ["=", [".c"], 3]]"#),
            "SELECT docs.* FROM docs WHERE (fl_value(body, 'a') = 1 AND fl_value(body, 'b') = 2) \
             AND fl_value(body, 'c') = 3"
        );
        assert_eq!(
            sql_of(r#"["OR", ["=", [".a"], 1], ["AND", ["=", [".b"], 2], ["=", [".c"], 3]]]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'a') = 1 OR (fl_value(body, 'b') = 2 \
             AND fl_value(body, 'c') = 3)"
        );
    }

    #[test]
    fn select_dict_with_order_by_desc() {
        assert_eq!(
            sql_of(
                r#"{"WHERE": [">", [".", "age"], 21],
                    "ORDER BY": [["DESC", [".", "age"]], [".", "name"]]}"#
            ),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'age') > 21 \
             ORDER BY fl_value(body, 'age') DESC, fl_value(body, 'name')"
        );
    }

    #[test]
    fn full_select_array_form() {
        assert_eq!(
            sql_of(r#"["SELECT", {"WHERE": ["=", [".", "a"], 1]}]"#),
            "SELECT docs.* FROM docs WHERE fl_value(body, 'a') = 1"
        );
    }

    #[test]
    fn reserved_select_keys_are_rejected() {
        for key in ["WHAT", "FROM", " FROM", "GROUP BY", "HAVING"] {
            let query = Value::Dict(vec![
                (
                    "WHERE".into(),
                    ast(r#"["=", [".", "a"], 1]"#),
                ),
                (key.into(), Value::Array(vec![])),
            ]);
            assert!(
                matches!(translate(&query, "docs", "body"), Err(QueryError::InvalidQuery(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn nested_select_uses_fresh_scope() {
        let sql = sql_of(
            r#"["=", [".", "n"],
                ["SELECT", {"WHERE": ["=", [".", "m"], ["$", "p"]]}]]"#,
        );
        assert!(sql.contains("(SELECT docs.* FROM docs WHERE fl_value(body, 'm') = $_p)"));
    }

    #[test]
    fn nested_select_parameters_are_merged() {
        let t = translate(
            &ast(r#"["=", [".", "n"], ["SELECT", {"WHERE": ["=", [".", "m"], ["$", "p"]]}]]"#),
            "docs",
            "body",
        )
        .unwrap();
        assert!(t.parameters.contains("p"));
    }

    #[test]
    fn malformed_property_paths_fail() {
        assert!(error_of(r#"[".", [0], "a"]"#).contains("array index"));
        assert!(error_of(r#"[".", "a", [1, 2]]"#).contains("exactly one"));
        assert!(error_of(r#"[".", "a", ["x"]]"#).contains("integer"));
        assert!(error_of(r#"[".", 42]"#).contains("property path"));
    }

    #[test]
    fn match_on_non_property_fails() {
        assert!(error_of(r#"["MATCH", "bio", "cat"]"#).contains("MATCH"));
    }

    #[test]
    fn repeated_match_reuses_fts_table() {
        let sql = sql_of(
            r#"["OR", ["MATCH", [".", "bio"], "cat"], ["MATCH", [".", "bio"], "dog"]]"#,
        );
        assert!(sql.contains("AS FTS1"));
        assert!(!sql.contains("FTS2"));
    }

    #[test]
    fn property_getter_helper() {
        assert_eq!(
            property_getter("addr.zip", "body").unwrap(),
            "fl_value(body, 'addr.zip')"
        );
        assert_eq!(property_getter("_id", "body").unwrap(), "key");
    }

    #[test]
    fn translate_expression_skips_select_wrapper() {
        let t = translate_expression(&ast(r#"["=", [".a"], 1]"#), "docs", "body").unwrap();
        assert_eq!(t.sql, "fl_value(body, 'a') = 1");
    }
}
