use crate::db::queries;
use crate::error::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;

const DEFAULT_LIMIT: i64 = 10;
const MAX_LIMIT: i64 = 50;

/// assistant 可调用的工具
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    RecentInvoices { limit: i64 },
    Invoice { invoice_id: i64 },
    VendorSummary { vendor: String },
    SavingsSummary,
    SearchEquipment { query: String },
}

#[derive(Deserialize)]
struct LimitArgs {
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct InvoiceArgs {
    invoice_id: i64,
}

#[derive(Deserialize)]
struct VendorArgs {
    vendor: String,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
}

impl ToolCall {
    /// 解析工具名和 JSON 参数
    pub fn parse(name: &str, arguments: &str) -> std::result::Result<Self, String> {
        let arguments = if arguments.trim().is_empty() {
            "{}"
        } else {
            arguments
        };
        let bad_args = |e: serde_json::Error| format!("invalid arguments for {}: {}", name, e);

        match name {
            "get_recent_invoices" => {
                let args: LimitArgs = serde_json::from_str(arguments).map_err(bad_args)?;
                Ok(ToolCall::RecentInvoices {
                    limit: args.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
                })
            }
            "get_invoice" => {
                let args: InvoiceArgs = serde_json::from_str(arguments).map_err(bad_args)?;
                Ok(ToolCall::Invoice {
                    invoice_id: args.invoice_id,
                })
            }
            "get_vendor_summary" => {
                let args: VendorArgs = serde_json::from_str(arguments).map_err(bad_args)?;
                non_blank(&args.vendor, "vendor")?;
                Ok(ToolCall::VendorSummary {
                    vendor: args.vendor.trim().to_string(),
                })
            }
            "get_savings_summary" => Ok(ToolCall::SavingsSummary),
            "search_equipment" => {
                let args: SearchArgs = serde_json::from_str(arguments).map_err(bad_args)?;
                non_blank(&args.query, "query")?;
                Ok(ToolCall::SearchEquipment {
                    query: args.query.trim().to_string(),
                })
            }
            other => Err(format!("unknown tool: {}", other)),
        }
    }

    /// 直接查询数据库, 返回可序列化结果
    pub async fn execute(&self, pool: &PgPool) -> Result<Value> {
        let value = match self {
            ToolCall::RecentInvoices { limit } => {
                json!({ "invoices": queries::list_recent_invoices(pool, *limit).await? })
            }
            ToolCall::Invoice { invoice_id } => match queries::get_invoice(pool, *invoice_id).await? {
                Some(invoice) => json!({ "invoice": invoice }),
                None => json!({ "error": format!("invoice {} not found", invoice_id) }),
            },
            ToolCall::VendorSummary { vendor } => {
                json!({ "summary": queries::vendor_summary(pool, vendor).await? })
            }
            ToolCall::SavingsSummary => json!({ "summary": queries::savings_totals(pool).await? }),
            ToolCall::SearchEquipment { query } => {
                json!({ "matches": queries::search_equipment(pool, query, MAX_LIMIT).await? })
            }
        };
        Ok(value)
    }
}

fn non_blank(value: &str, field: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", field))
    } else {
        Ok(())
    }
}

/// 执行一次工具调用; 错误以 {"error": ...} 返回给 assistant, run 继续
pub async fn dispatch(pool: &PgPool, name: &str, arguments: &str) -> (String, bool) {
    let call = match ToolCall::parse(name, arguments) {
        Ok(call) => call,
        Err(message) => {
            tracing::warn!(tool = %name, %message, "工具参数无效");
            return (json!({ "error": message }).to_string(), false);
        }
    };

    match call.execute(pool).await {
        Ok(value) => (value.to_string(), true),
        Err(e) => {
            tracing::error!(tool = %name, error = %e, "工具执行失败");
            (json!({ "error": e.to_string() }).to_string(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_tools() {
        assert_eq!(
            ToolCall::parse("get_recent_invoices", r#"{"limit": 500}"#),
            Ok(ToolCall::RecentInvoices { limit: 50 })
        );
        assert_eq!(
            ToolCall::parse("get_recent_invoices", ""),
            Ok(ToolCall::RecentInvoices { limit: 10 })
        );
        assert_eq!(
            ToolCall::parse("get_invoice", r#"{"invoice_id": 42}"#),
            Ok(ToolCall::Invoice { invoice_id: 42 })
        );
        assert_eq!(
            ToolCall::parse("get_vendor_summary", r#"{"vendor": " Sunbelt "}"#),
            Ok(ToolCall::VendorSummary {
                vendor: "Sunbelt".into()
            })
        );
        assert_eq!(
            ToolCall::parse("get_savings_summary", "{}"),
            Ok(ToolCall::SavingsSummary)
        );
    }

    #[test]
    fn rejects_unknown_tool_and_bad_args() {
        assert!(ToolCall::parse("drop_tables", "{}")
            .unwrap_err()
            .contains("unknown tool"));
        assert!(ToolCall::parse("get_invoice", r#"{"invoice_id": "abc"}"#)
            .unwrap_err()
            .contains("invalid arguments"));
        assert!(ToolCall::parse("search_equipment", r#"{"query": "  "}"#).is_err());
    }

    #[tokio::test]
    async fn dispatch_reports_parse_errors_without_touching_db() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let (output, ok) = dispatch(&pool, "nope", "{}").await;
        assert!(!ok);
        let value: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["error"], "unknown tool: nope");
    }
}
