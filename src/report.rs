use crate::store::SummaryRecord;

const RULE_WIDTH: usize = 80;

/// Renders stored records as a fixed-width table, headed by the most recent `processed_at` among them.
pub fn format_summary(records: &[SummaryRecord]) -> String {
    let Some(processed_at) = records.iter().map(|r| r.processed_at).max() else {
        return "No results found.".to_string();
    };

    let rule = "-".repeat(RULE_WIDTH);
    let mut lines = vec![
        format!(
            "Housing Data Summary (processed at {})",
            processed_at.format("%Y-%m-%d %H:%M:%S")
        ),
        rule.clone(),
        format!(
            "{:<15} {:>20} {:>15}",
            "Category", "Average Value ($)", "Record Count"
        ),
        rule,
    ];

    lines.extend(records.iter().map(|record| {
        format!(
            "{:<15} {:>20} {:>15}",
            record.category,
            format_currency(record.average_value),
            group_thousands(&record.record_count.to_string())
        )
    }));

    lines.join("\n")
}

/// `1234.5` -> `$1,234.50`
pub fn format_currency(value: f64) -> String {
    if !value.is_finite() {
        return format!("${value}");
    }

    let formatted = format!("{:.2}", value.abs());
    let (whole, cents) = formatted.split_once('.').unwrap_or((&formatted, "00"));
    let sign = if value < 0.0 { "-" } else { "" };

    format!("${sign}{}.{cents}", group_thousands(whole))
}

fn group_thousands(digits: &str) -> String {
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    grouped
}
