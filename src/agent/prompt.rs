use serde::{Deserialize, Serialize};

use crate::agent::parser::{CLOSE_TAG, OPEN_TAG};

/// A dataset column as described to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Semantic type, e.g. `M/D/YY` or `card or cash`.
    pub description: String,
}

impl Column {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSchema {
    pub columns: Vec<Column>,
}

impl DatasetSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// The vending-machine coffee sales table.
    pub fn coffee_sales() -> Self {
        Self::new(vec![
            Column::new("date", "M/D/YY"),
            Column::new("time", "HH:MM"),
            Column::new("cash_type", "card or cash"),
            Column::new("card", "string"),
            Column::new("price", "number"),
            Column::new("coffee_name", "string"),
            Column::new("quarter", "1-4"),
            Column::new("month", "1-12"),
            Column::new("year", "YYYY"),
        ])
    }

    fn render(&self) -> String {
        self.columns
            .iter()
            .map(|c| format!("- {} ({})", c.name, c.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Hard constraints placed on generated code.
#[derive(Debug, Clone)]
pub struct CodeConstraints {
    pub dpi: u32,
    pub dataset_binding: String,
}

impl Default for CodeConstraints {
    fn default() -> Self {
        Self {
            dpi: 300,
            dataset_binding: "df".to_string(),
        }
    }
}

pub fn build_generation_prompt(
    instruction: &str,
    schema: &DatasetSchema,
    output_path: &str,
    constraints: &CodeConstraints,
) -> String {
    let df = &constraints.dataset_binding;
    let dpi = constraints.dpi;
    format!(
        r#"You are a data visualization expert.

Return your answer *strictly* in this format:

{OPEN_TAG}
# valid python code here
{CLOSE_TAG}

Do not add explanations, only the tags and the code.

The code should create a visualization from a DataFrame '{df}' with these columns:
{schema}

User instruction: {instruction}

Requirements for the code:
1. Assume the DataFrame is already loaded as '{df}'. Do not read any files.
2. Use matplotlib for plotting (pandas for data wrangling; no seaborn).
3. Add clear title, axis labels, and legend if needed.
4. Save the figure as '{output_path}' with dpi={dpi}.
5. Do not call plt.show().
6. Close all plots with plt.close().
7. Add all necessary import statements.

Return ONLY the code wrapped in {OPEN_TAG} tags."#,
        schema = schema.render(),
    )
}

pub fn build_reflection_prompt(
    instruction: &str,
    schema: &DatasetSchema,
    original_code: &str,
    output_path: &str,
    constraints: &CodeConstraints,
) -> String {
    let df = &constraints.dataset_binding;
    let dpi = constraints.dpi;
    let original_code = if original_code.trim().is_empty() {
        "(no code was produced)"
    } else {
        original_code
    };
    format!(
        r#"You are a data visualization expert.
Your task: critique the attached chart and the original code against the given instruction,
then return improved matplotlib code.

Original code (for context):
{original_code}

OUTPUT FORMAT (STRICT!):
1) First line: a valid JSON object with ONLY the "feedback" field.
Example: {{"feedback": "The legend is unclear and the axis labels overlap."}}

2) After a newline, output ONLY the refined Python code wrapped in:
{OPEN_TAG}
...
{CLOSE_TAG}

3) Import all necessary libraries in the code. Don't assume any imports from the original code.

HARD CONSTRAINTS:
- Do NOT include Markdown, backticks, or any extra prose outside the two parts above.
- Use pandas/matplotlib only (no seaborn).
- Assume {df} already exists; do not read from files.
- Save to '{output_path}' with dpi={dpi}.
- Always call plt.close() at the end (no plt.show()).
- Include all necessary import statements.

Schema (columns available in {df}):
{schema}

Instruction:
{instruction}"#,
        schema = schema.render(),
    )
}
