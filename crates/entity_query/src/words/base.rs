//! Stack manipulation, arithmetic, comparison and word binding.

use entity_store::CompareOp;
use entity_store::filter::{FilterValue, compare_value};
use serde_json::{Number, Value};
use tracing::{debug, info};

use super::sync;
use crate::error::{Result, StackError};
use crate::stack::{QueryStack, WordHandler, WordResult, WordTable};
use crate::value::{SType, StackValue};

pub fn register(words: &mut WordTable) {
    words.register("dup", &[SType::Any], sync(on_dup));
    words.register("over", &[SType::Any, SType::Any], sync(on_over));
    words.register("drop", &[SType::Any], sync(on_drop));
    words.register("swap", &[SType::Any, SType::Any], sync(on_swap));
    words.register("rot", &[SType::Any, SType::Any, SType::Any], sync(on_rot));
    words.register("clear", &[], sync(on_clear));
    words.register("print", &[SType::Any], sync(on_print));
    words.register("..", &[], sync(on_print_stack));
    words.register("to_str", &[SType::Any], sync(on_to_str));
    words.register("type", &[SType::Any], sync(on_type));
    words.register("assert_type", &[SType::Any, SType::Value], sync(on_assert_type));
    words.register("version", &[], sync(on_version));

    for op in ["+", "-", "*", "/", "%"] {
        words.register(op, &[SType::Value, SType::Value], sync(on_arithmetic));
    }
    for op in ["==", "!="] {
        words.register(op, &[SType::Any, SType::Any], sync(on_equals));
    }
    for op in ["<", "<=", ">", ">="] {
        words.register(op, &[SType::Value, SType::Value], sync(on_compare));
        words.register(op, &[SType::DateTime, SType::DateTime], sync(on_compare_dates));
    }
    for op in ["and", "or"] {
        words.register(op, &[SType::Any, SType::Any], sync(on_logic));
    }

    words.register("define", &[SType::Any, SType::Value], sync(on_define));
    words.register("let", &[SType::Any, SType::Value], sync(on_define));
    words.register("!", &[SType::Any, SType::Value], sync(on_define));
}

fn on_dup(stack: &mut QueryStack, _: &str) -> WordResult {
    Ok(stack.peek().cloned())
}

fn on_over(stack: &mut QueryStack, _: &str) -> WordResult {
    Ok(stack.peek_at(1).cloned())
}

fn on_drop(stack: &mut QueryStack, _: &str) -> WordResult {
    stack.pop()?;
    Ok(None)
}

fn on_swap(stack: &mut QueryStack, _: &str) -> WordResult {
    let b = stack.pop()?;
    let a = stack.pop()?;
    stack.push_raw(b);
    Ok(Some(a))
}

/// `a b c -> b c a`
fn on_rot(stack: &mut QueryStack, _: &str) -> WordResult {
    let c = stack.pop()?;
    let b = stack.pop()?;
    let a = stack.pop()?;
    stack.push_raw(b);
    stack.push_raw(c);
    Ok(Some(a))
}

fn on_clear(stack: &mut QueryStack, _: &str) -> WordResult {
    stack.clear_items();
    Ok(None)
}

fn on_print(stack: &mut QueryStack, _: &str) -> WordResult {
    let value = stack.pop()?;
    info!(value = %value, "print");
    Ok(None)
}

fn on_print_stack(stack: &mut QueryStack, _: &str) -> WordResult {
    let items: Vec<String> = stack.items().iter().map(ToString::to_string).collect();
    info!(depth = stack.depth(), items = ?items, "stack");
    Ok(None)
}

fn on_to_str(stack: &mut QueryStack, _: &str) -> WordResult {
    let value = stack.pop()?;
    Ok(Some(StackValue::string(value.to_string())))
}

/// Pushes the type name of the top value, leaving it in place.
fn on_type(stack: &mut QueryStack, _: &str) -> WordResult {
    Ok(stack.peek().map(|v| StackValue::string(v.stype().as_str())))
}

fn on_assert_type(stack: &mut QueryStack, _: &str) -> WordResult {
    let name = stack.pop()?.into_string()?;
    let expected = SType::parse(&name).ok_or_else(|| StackError::invalid(format!("unknown type: {name}")))?;
    let found = stack.peek().ok_or(StackError::Underflow)?.stype();
    if !expected.accepts(found) {
        return Err(StackError::invalid(format!("expected {expected}, found {found}")));
    }
    Ok(None)
}

fn on_version(_: &mut QueryStack, _: &str) -> WordResult {
    Ok(Some(StackValue::string(env!("CARGO_PKG_VERSION"))))
}

fn on_arithmetic(stack: &mut QueryStack, word: &str) -> WordResult {
    let rhs = stack.pop()?.into_value()?;
    let lhs = stack.pop()?.into_value()?;
    Ok(Some(arithmetic(word, &lhs, &rhs)?.into()))
}

fn arithmetic(word: &str, lhs: &Value, rhs: &Value) -> Result<Value> {
    if word == "+" {
        match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => return Ok(Value::String(format!("{a}{b}"))),
            (Value::String(a), b) => return Ok(Value::String(format!("{a}{b}"))),
            (a, Value::String(b)) => return Ok(Value::String(format!("{a}{b}"))),
            _ => {}
        }
    }

    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let exact = match word {
            "+" => a.checked_add(b),
            "-" => a.checked_sub(b),
            "*" => a.checked_mul(b),
            "/" if b != 0 && a % b == 0 => a.checked_div(b),
            "%" if b != 0 => a.checked_rem(b),
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
        return Err(StackError::invalid(format!("cannot apply {word} to {lhs} and {rhs}")));
    };
    if b == 0.0 && matches!(word, "/" | "%") {
        return Err(StackError::invalid("division by zero"));
    }
    let n = match word {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a % b,
        other => return Err(StackError::UnknownWord(other.to_string())),
    };
    Ok(Number::from_f64(n).map_or(Value::Null, Value::Number))
}

fn on_equals(stack: &mut QueryStack, word: &str) -> WordResult {
    let rhs = stack.pop()?;
    let lhs = stack.pop()?;
    let equal = lhs == rhs;
    Ok(Some(Value::Bool(if word == "==" { equal } else { !equal }).into()))
}

fn compare_op(word: &str) -> Result<CompareOp> {
    CompareOp::from_word(word).ok_or_else(|| StackError::UnknownWord(word.to_string()))
}

fn on_compare(stack: &mut QueryStack, word: &str) -> WordResult {
    let op = compare_op(word)?;
    let rhs = stack.pop()?.into_value()?;
    let lhs = stack.pop()?.into_value()?;
    Ok(Some(Value::Bool(compare_value(op, &lhs, &FilterValue::Value(rhs))).into()))
}

fn on_compare_dates(stack: &mut QueryStack, word: &str) -> WordResult {
    let op = compare_op(word)?;
    let (StackValue::DateTime(rhs), StackValue::DateTime(lhs)) = (stack.pop()?, stack.pop()?) else {
        return Err(StackError::invalid("expected two dates"));
    };
    Ok(Some(Value::Bool(op.accepts(lhs.cmp(&rhs))).into()))
}

fn on_logic(stack: &mut QueryStack, word: &str) -> WordResult {
    let rhs = stack.pop()?.is_truthy();
    let lhs = stack.pop()?.is_truthy();
    let result = if word == "and" { lhs && rhs } else { lhs || rhs };
    Ok(Some(Value::Bool(result).into()))
}

/// `value name define` binds a macro; `value name let` and its shorthand
/// `value name !` bind a constant.
fn on_define(stack: &mut QueryStack, word: &str) -> WordResult {
    let name = stack.pop()?.into_string()?;
    let value = stack.pop()?;
    let handler = if word == "define" {
        match value {
            StackValue::List(body) => WordHandler::Macro(body),
            other => WordHandler::Macro(vec![other]),
        }
    } else {
        WordHandler::Constant(value)
    };
    debug!(word = %name, binding = word, "bind word");
    stack.words_mut().define(&name, handler);
    Ok(None)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::error::StackError;
    use crate::value::StackValue;
    use crate::words::create_stack;

    async fn run(text: &str) -> Vec<serde_json::Value> {
        let mut stack = create_stack();
        stack.run(text).await.unwrap();
        stack.items().iter().map(StackValue::to_json).collect()
    }

    #[tokio::test]
    async fn test_define_evaluates_on_reference() {
        assert_eq!(run("[1 2 +] x define x").await, vec![json!(3)]);
        assert_eq!(run("[1 2 +] x define x x +").await, vec![json!(6)]);
    }

    #[tokio::test]
    async fn test_let_pushes_verbatim() {
        let mut stack = create_stack();
        stack.run("[1 2 +] x let x").await.unwrap();
        assert_eq!(
            stack.items(),
            &[StackValue::List(vec![json!(1).into(), json!(2).into(), StackValue::Word("+".into())])]
        );
    }

    #[tokio::test]
    async fn test_bang_binds_a_constant() {
        assert_eq!(run("5 n ! $n n +").await, vec![json!(10)]);
    }

    #[tokio::test]
    async fn test_self_referencing_define_is_an_error() {
        let mut stack = create_stack();
        let err = stack.run("[x] x define x").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::RecursionLimit(_))));
        assert_eq!(stack.depth(), 1);

        stack.run("1 2 +").await.unwrap();
        assert_eq!(stack.items(), &[StackValue::from(json!(3))]);
    }

    #[tokio::test]
    async fn test_stack_words() {
        assert_eq!(run("1 2 swap").await, vec![json!(2), json!(1)]);
        assert_eq!(run("1 2 3 rot").await, vec![json!(2), json!(3), json!(1)]);
        assert_eq!(run("1 2 over").await, vec![json!(1), json!(2), json!(1)]);
        assert_eq!(run("1 dup drop").await, vec![json!(1)]);
        assert_eq!(run("1 2 clear 3").await, vec![json!(3)]);
        assert_eq!(run("[1] type").await, vec![json!([1]), json!("list")]);
    }

    #[tokio::test]
    async fn test_arithmetic() {
        assert_eq!(run("2 3 + 4 *").await, vec![json!(20)]);
        assert_eq!(run("7 2 /").await, vec![json!(3.5)]);
        assert_eq!(run("8 2 / 7 3 %").await, vec![json!(4), json!(1)]);
        assert_eq!(run("1.5 1 -").await, vec![json!(0.5)]);
        assert_eq!(run(r#""count: " 3 +"#).await, vec![json!("count: 3")]);

        let mut stack = create_stack();
        let err = stack.run("1 0 /").await.unwrap_err();
        assert!(matches!(err.stack_error(), Some(StackError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_comparisons_and_logic() {
        assert_eq!(run("2 2.0 == 1 2 !=").await, vec![json!(true), json!(true)]);
        assert_eq!(run("1 2 < b a >=").await, vec![json!(true), json!(true)]);
        assert_eq!(run("~d/2021-01-01/ ~d/2020-06-01/ >").await, vec![json!(true)]);
        assert_eq!(run("1 0 and 1 0 or").await, vec![json!(false), json!(true)]);
    }

    #[tokio::test]
    async fn test_to_str_and_assert_type() {
        assert_eq!(run("[1 2] to_str").await, vec![json!("[1,2]")]);
        assert_eq!(run("5 value assert_type").await, vec![json!(5)]);

        let mut stack = create_stack();
        assert!(stack.run("5 list assert_type").await.is_err());
    }
}
