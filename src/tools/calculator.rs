use serde::Deserialize;
use serde_json::json;

use crate::error::ToolError;
use crate::tools::{ToolOutcome, ToolSpec};

pub const CALCULATOR_TOOL: &str = "calculator";
pub const CALCULATOR_PROMPT: &str = "You are a calculator.";
const CALCULATOR_DESCRIPTION: &str = "Calculate the result of a and b based on the operation. \
     Always use this function to calculate and don't invent your own even if you know the answer.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Deserialize)]
struct CalculatorArgs {
    a: f64,
    b: f64,
    operation: Operation,
}

pub fn calculate(a: f64, b: f64, operation: Operation) -> Result<f64, ToolError> {
    match operation {
        Operation::Add => Ok(a + b),
        Operation::Subtract => Ok(a - b),
        Operation::Multiply => Ok(a * b),
        Operation::Divide if b == 0.0 => {
            Err(ToolError::Execution("Cannot divide by zero".to_string()))
        }
        Operation::Divide => Ok(a / b),
    }
}

pub fn calculator_tool() -> ToolSpec {
    ToolSpec::new(CALCULATOR_TOOL, CALCULATOR_DESCRIPTION)
    .with_schema(json!({
        "type": "object",
        "properties": {
            "a": {"type": "number", "description": "The first number"},
            "b": {"type": "number", "description": "The second number"},
            "operation": {
                "type": "string",
                "enum": ["add", "subtract", "multiply", "divide"]
            }
        },
        "required": ["a", "b", "operation"],
        "additionalProperties": false
    }))
    .expect("valid schema")
    .with_handler(|args, _deps| {
        let parsed = serde_json::from_value::<CalculatorArgs>(args);
        async move {
            let args = parsed.map_err(|err| ToolError::InvalidArguments {
                tool: CALCULATOR_TOOL.to_string(),
                message: err.to_string(),
            })?;
            let result = calculate(args.a, args.b, args.operation)?;
            Ok(ToolOutcome::Text(format!("{result:?}")))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::DependencyMap;

    #[tokio::test]
    async fn multiplies_like_a_float() {
        let outcome = calculator_tool()
            .execute(
                json!({"a": 3, "b": 1, "operation": "multiply"}),
                &DependencyMap::new(),
            )
            .await
            .expect("calculates");

        assert_eq!(outcome, ToolOutcome::Text("3.0".to_string()));
    }

    #[tokio::test]
    async fn divide_by_zero_is_an_error() {
        let err = calculator_tool()
            .execute(
                json!({"a": 1, "b": 0, "operation": "divide"}),
                &DependencyMap::new(),
            )
            .await
            .expect_err("division by zero");

        assert_eq!(err.to_string(), "tool execution failed: Cannot divide by zero");
    }

    #[tokio::test]
    async fn unknown_operation_is_invalid() {
        let err = calculator_tool()
            .execute(
                json!({"a": 1, "b": 2, "operation": "modulo"}),
                &DependencyMap::new(),
            )
            .await
            .expect_err("unknown operation");

        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[test]
    fn description_tells_the_model_to_always_use_the_tool() {
        assert_eq!(
            calculator_tool().description(),
            "Calculate the result of a and b based on the operation. Always use this \
             function to calculate and don't invent your own even if you know the answer."
        );
    }

    #[test]
    fn subtract_and_divide() {
        assert_eq!(calculate(5.0, 7.5, Operation::Subtract).expect("ok"), -2.5);
        assert_eq!(calculate(9.0, 4.0, Operation::Divide).expect("ok"), 2.25);
    }
}
