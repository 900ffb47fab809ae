//! Built-in table configurations.
//!
//! Registered at engine construction; config-file tables with the same name
//! take precedence.

use serde_json::json;

use super::{ColumnType, FieldConfig, SaveMode, TableConfig};

fn string(name: &str) -> FieldConfig {
    FieldConfig::new(name, ColumnType::String)
}

fn float(name: &str) -> FieldConfig {
    FieldConfig::new(name, ColumnType::Float)
}

fn date(name: &str) -> FieldConfig {
    FieldConfig::new(name, ColumnType::Date)
}

pub fn builtin_table_configs() -> Vec<TableConfig> {
    vec![
        TableConfig::new("stock_daily_quote")
            .primary_key(&["code", "trade_date"])
            .field(string("code").required().sources(&["code", "symbol"]))
            .field(string("name").sources(&["name", "stock_name"]))
            .field(date("trade_date").required().sources(&["trade_date", "date"]))
            .field(float("open"))
            .field(float("high"))
            .field(float("low"))
            .field(float("close"))
            .field(float("volume"))
            .field(float("amount"))
            .field(float("change").sources(&["change", "chg"]))
            .field(float("change_pct").sources(&["change_pct", "pct_chg"]))
            .field(float("turnover_rate"))
            .field(float("market_cap")),
        TableConfig::new("stock_basic")
            .primary_key(&["code"])
            .field(string("code").required())
            .field(string("name").required())
            .field(string("industry"))
            .field(string("market"))
            .field(date("list_date"))
            .field(float("total_shares"))
            .field(float("circulating_shares"))
            .field(float("market_cap"))
            .field(float("pe_ratio"))
            .field(float("pb_ratio")),
        TableConfig::new("news")
            .primary_key(&["news_id"])
            .field(string("news_id").required().sources(&["news_id", "id"]))
            .field(string("title").required())
            .field(string("content"))
            .field(string("source"))
            .field(string("category"))
            .field(
                FieldConfig::new("published_at", ColumnType::Datetime)
                    .sources(&["published_at", "publish_time"]),
            ),
        TableConfig::new("stock_money_flow")
            .primary_key(&["code", "trade_date"])
            .field(string("code").required())
            .field(string("name"))
            .field(date("trade_date").required().sources(&["trade_date", "date"]))
            .field(float("main_net_inflow"))
            .field(float("main_net_inflow_pct"))
            .field(float("super_large_net_inflow"))
            .field(float("large_net_inflow"))
            .field(float("medium_net_inflow"))
            .field(float("small_net_inflow")),
        TableConfig::new("stock_financial_indicator")
            .primary_key(&["code", "report_date"])
            .field(string("code").required())
            .field(string("name"))
            .field(date("report_date").required())
            .field(float("eps"))
            .field(float("bps"))
            .field(float("roe"))
            .field(float("roa"))
            .field(float("gross_margin"))
            .field(float("net_margin"))
            .field(float("revenue"))
            .field(float("net_profit")),
        TableConfig::new("north_money")
            .primary_key(&["trade_date"])
            .field(date("trade_date").required().sources(&["trade_date", "date"]))
            .field(float("sh_net_inflow"))
            .field(float("sz_net_inflow"))
            .field(
                float("total_net_inflow").sources(&["total_net_inflow", "net_inflow"]),
            ),
        TableConfig::new("industry_quote")
            .primary_key(&["code", "trade_date"])
            .field(string("code").required())
            .field(string("name"))
            .field(date("trade_date").required())
            .field(float("open"))
            .field(float("high"))
            .field(float("low"))
            .field(float("close"))
            .field(float("volume"))
            .field(float("amount"))
            .field(float("change_pct")),
        TableConfig::new("concept_quote")
            .primary_key(&["code", "trade_date"])
            .field(string("code").required())
            .field(string("name"))
            .field(date("trade_date").required())
            .field(float("open"))
            .field(float("high"))
            .field(float("low"))
            .field(float("close"))
            .field(float("volume"))
            .field(float("amount"))
            .field(float("change_pct")),
        TableConfig::new("company_profile")
            .primary_key(&["code"])
            .field(string("code").required())
            .field(string("name"))
            .field(string("industry"))
            .field(string("sector"))
            .field(string("description"))
            .field(string("website"))
            .field(FieldConfig::new("employees", ColumnType::Integer)),
        // Factor tables take the high-volume batch size.
        TableConfig::new("factor_data")
            .primary_key(&["factor_id", "code", "trade_date"])
            .batch_size(5000)
            .field(string("factor_id").required())
            .field(string("code").required())
            .field(date("trade_date").required())
            .field(string("factor_name"))
            .field(string("factor_category"))
            .field(float("factor_value"))
            .field(FieldConfig::new("collected_at", ColumnType::Datetime)),
        TableConfig::new("income_statement")
            .primary_key(&["code", "report_date", "report_period"])
            .field(string("code").required())
            .field(date("report_date").required())
            .field(string("report_period").default_value(json!("annual")))
            .field(float("total_revenue"))
            .field(float("operating_revenue"))
            .field(float("gross_profit"))
            .field(float("operating_profit"))
            .field(float("total_profit"))
            .field(float("net_profit"))
            .field(float("basic_eps"))
            .field(float("diluted_eps")),
        TableConfig::new("balance_sheet")
            .primary_key(&["code", "report_date", "report_period"])
            .field(string("code").required())
            .field(date("report_date").required())
            .field(string("report_period").default_value(json!("annual")))
            .field(float("total_assets"))
            .field(float("total_liabilities"))
            .field(float("total_equity"))
            .field(float("current_assets"))
            .field(float("current_liabilities"))
            .field(float("cash"))
            .field(float("inventory")),
        TableConfig::new("dividend_data")
            .primary_key(&["code", "report_year"])
            .field(string("code").required())
            .field(string("report_year").required())
            .field(date("ex_date"))
            .field(float("dividend_per_share"))
            .field(float("bonus_per_share"))
            .field(float("total_dividend"))
            .field(float("dividend_yield")),
        TableConfig::new("macro_economic")
            .primary_key(&["indicator_id", "report_date"])
            .field(string("indicator_id").required().sources(&["indicator_id", "indicator_code"]))
            .field(string("indicator_name"))
            .field(date("report_date").required().sources(&["report_date", "period"]))
            .field(float("value"))
            .field(string("unit"))
            .field(string("source")),
        // Knowledge-graph records are dual-written; the relational copy
        // keeps properties as JSON text.
        TableConfig::new("kg_entity")
            .primary_key(&["entity_id"])
            .field(string("entity_id").required())
            .field(string("entity_type"))
            .field(string("name"))
            .field(string("code"))
            .field(string("industry"))
            .field(FieldConfig::new("properties", ColumnType::Json))
            .field(string("source"))
            .field(float("confidence"))
            .field(FieldConfig::new("collected_at", ColumnType::Datetime)),
        TableConfig::new("kg_relation")
            .primary_key(&["relation_id"])
            .field(string("relation_id").required())
            .field(string("source_entity_id").required())
            .field(string("target_entity_id").required())
            .field(string("relation_type"))
            .field(float("weight"))
            .field(float("confidence"))
            .field(string("evidence"))
            .field(FieldConfig::new("properties", ColumnType::Json))
            .field(string("source"))
            .field(FieldConfig::new("collected_at", ColumnType::Datetime)),
        TableConfig::new("kg_event")
            .primary_key(&["event_id"])
            .field(string("event_id").required())
            .field(string("event_type"))
            .field(string("title"))
            .field(string("content"))
            .field(date("event_date"))
            .field(string("impact_level"))
            .field(float("sentiment"))
            .field(string("source"))
            .field(float("confidence"))
            .field(FieldConfig::new("collected_at", ColumnType::Datetime)),
    ]
    .into_iter()
    .map(|t| t.save_mode(SaveMode::Upsert))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_have_usable_keys() {
        let tables = builtin_table_configs();
        assert!(tables.iter().any(|t| t.table_name == "stock_daily_quote"));

        for table in &tables {
            assert!(!table.primary_key.is_empty(), "{}", table.table_name);
            // Every primary key column must be a declared field.
            for key in &table.primary_key {
                assert!(
                    table.fields.iter().any(|f| &f.name == key),
                    "{} missing pk column {key}",
                    table.table_name
                );
            }
            assert_eq!(table.save_mode, SaveMode::Upsert);
        }
    }

    #[test]
    fn factor_table_uses_bulk_batches() {
        let tables = builtin_table_configs();
        let factor = tables.iter().find(|t| t.table_name == "factor_data").unwrap();
        assert_eq!(factor.batch_size, Some(5000));
    }
}
