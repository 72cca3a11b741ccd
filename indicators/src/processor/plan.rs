use crate::utils::sql::{qualified, quote_ident};

/// IBGE municipality code length without the check digit.
pub const MUNICIPALITY_CODE_WIDTH: usize = 6;

/// Rewrites a join key before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransform {
    Identity,
    /// Keep the first `n` characters of the textual key. The result is
    /// pinned to `Utf8` since `substr` may yield `Utf8View`.
    Truncate(usize),
}

impl KeyTransform {
    pub const MUNICIPALITY: KeyTransform = KeyTransform::Truncate(MUNICIPALITY_CODE_WIDTH);

    pub fn apply(&self, expr: &str) -> String {
        match self {
            KeyTransform::Identity => format!("CAST({} AS VARCHAR)", expr),
            KeyTransform::Truncate(n) => format!(
                "arrow_cast(substr(CAST({} AS VARCHAR), 1, {}), 'Utf8')",
                expr, n
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Inner => "JOIN",
        }
    }
}

/// One external indicator table joined onto the municipality base.
#[derive(Debug, Clone)]
pub struct IndicatorSource {
    pub table: &'static str,
    pub key_column: &'static str,
    pub key: KeyTransform,
    pub join: JoinKind,
    /// `(source column, output column)`.
    pub columns: ColumnPairs,
    /// `(output column, expression)`; `{t}` is the source alias and `{base}`
    /// the municipality base alias.
    pub derived: ColumnPairs,
}

pub const JOIN_KEY: &str = "join_key";

impl IndicatorSource {
    pub fn view_name(&self) -> String {
        format!("ext_{}", self.table)
    }

    /// Pre-aggregates the table to one row per transformed key. Columns not in
    /// `available` are emitted as typed nulls and returned.
    pub fn view_sql(&self, available: &[String]) -> (String, Vec<&'static str>) {
        let key = self.key.apply(&quote_ident(self.key_column));
        let mut missing = Vec::new();

        let mut projections = vec![format!("{} AS {}", key, JOIN_KEY)];
        for (source, output) in self.columns {
            if available.iter().any(|c| c == source) {
                projections.push(format!(
                    "MAX(TRY_CAST({} AS DOUBLE)) AS {}",
                    quote_ident(source),
                    quote_ident(output)
                ));
            } else {
                missing.push(*source);
                projections.push(format!("CAST(NULL AS DOUBLE) AS {}", quote_ident(output)));
            }
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} IS NOT NULL GROUP BY {}",
            projections.join(", "),
            quote_ident(self.table),
            quote_ident(self.key_column),
            key
        );
        (sql, missing)
    }

    pub fn join_clause(&self, alias: &str, base_alias: &str) -> String {
        format!(
            "{} {} {} ON {} = {}",
            self.join.as_sql(),
            quote_ident(&self.view_name()),
            alias,
            qualified(alias, JOIN_KEY),
            qualified(base_alias, "municipality_code")
        )
    }

    /// Output projections in declaration order, derived columns after the
    /// column they are computed from.
    pub fn projections(&self, alias: &str, base_alias: &str) -> Vec<String> {
        let mut projections: Vec<String> = self
            .columns
            .iter()
            .map(|(_, output)| format!("{} AS {}", qualified(alias, output), quote_ident(output)))
            .collect();

        for (output, expr) in self.derived {
            let expr = expr.replace("{t}", alias).replace("{base}", base_alias);
            projections.push(format!("{} AS {}", expr, quote_ident(output)));
        }
        projections
    }
}

type ColumnPairs = &'static [(&'static str, &'static str)];

fn municipality(table: &'static str, columns: ColumnPairs, derived: ColumnPairs) -> IndicatorSource {
    IndicatorSource {
        table,
        key_column: "codigo",
        key: KeyTransform::MUNICIPALITY,
        join: JoinKind::Left,
        columns,
        derived,
    }
}

pub fn external_indicator_plan() -> Vec<IndicatorSource> {
    vec![
        municipality(
            "taxa_de_alfabetizacao",
            &[("total", "literacy_rate")],
            &[("illiteracy_rate", "100 - {t}.literacy_rate")],
        ),
        municipality(
            "taxa_coleta_lixo",
            &[("pct_coletado", "garbage_collection_pct")],
            &[],
        ),
        municipality(
            "taxa_rede_esgoto",
            &[("sim", "sewage_network_pct"), ("nao", "no_sewage_network_pct")],
            &[],
        ),
        municipality(
            "anos_de_estudo",
            &[
                ("total", "avg_schooling_years"),
                ("11_14", "avg_schooling_years_11_14"),
                ("15_17", "avg_schooling_years_15_17"),
                ("18_24", "avg_schooling_years_18_24"),
                ("25_mais", "avg_schooling_years_25_plus"),
            ],
            &[],
        ),
        municipality(
            "taxa_populacao_nivel_instrucao",
            &[
                ("sem_instrucao_fundamental_incompleto", "adults_no_schooling_pct"),
                ("fundamental_completo_medio_incompleto", "adults_primary_complete_pct"),
                ("medio_completo_superior_incompleto", "adults_secondary_complete_pct"),
                ("superior_completo", "adults_higher_complete_pct"),
            ],
            &[],
        ),
        municipality(
            "taxa_distribuicao_etaria",
            &[("pct_60_mais", "elderly_pct")],
            &[],
        ),
        municipality(
            "pop_res_favela",
            &[("total", "favela_residents")],
            &[(
                "favela_population_rate",
                "{t}.favela_residents / NULLIF({base}.population, 0)",
            )],
        ),
        municipality(
            "taxa_situacao_domicilio",
            &[("urbana", "urban_population_pct"), ("rural", "rural_population_pct")],
            &[],
        ),
        municipality(
            "taxa_frequencia_escolar",
            &[("total", "school_attendance_rate")],
            &[],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EXTERNAL_TABLES;

    #[test]
    fn test_key_transform() {
        assert_eq!(
            KeyTransform::Truncate(6).apply("\"codigo\""),
            "arrow_cast(substr(CAST(\"codigo\" AS VARCHAR), 1, 6), 'Utf8')"
        );
        assert_eq!(KeyTransform::Identity.apply("x"), "CAST(x AS VARCHAR)");
    }

    #[test]
    fn test_plan_covers_every_external_table() {
        let plan = external_indicator_plan();
        assert_eq!(plan.len(), EXTERNAL_TABLES.len());
        for table in EXTERNAL_TABLES {
            let source = plan.iter().find(|s| s.table == table).unwrap();
            assert_eq!(source.key, KeyTransform::Truncate(6));
            assert_eq!(source.join, JoinKind::Left);
        }
    }

    #[test]
    fn test_view_sql_nulls_missing_columns() {
        let plan = external_indicator_plan();
        let esgoto = plan.iter().find(|s| s.table == "taxa_rede_esgoto").unwrap();
        let (sql, missing) = esgoto.view_sql(&["codigo".to_string(), "sim".to_string()]);

        assert_eq!(missing, vec!["nao"]);
        assert!(sql.contains("MAX(TRY_CAST(\"sim\" AS DOUBLE)) AS \"sewage_network_pct\""));
        assert!(sql.contains("CAST(NULL AS DOUBLE) AS \"no_sewage_network_pct\""));
        assert!(sql.contains("GROUP BY arrow_cast(substr(CAST(\"codigo\" AS VARCHAR), 1, 6), 'Utf8')"));
    }

    #[test]
    fn test_derived_projection_uses_aliases() {
        let plan = external_indicator_plan();
        let favela = plan.iter().find(|s| s.table == "pop_res_favela").unwrap();
        let projections = favela.projections("x6", "base");
        assert_eq!(projections[0], "x6.\"favela_residents\" AS \"favela_residents\"");
        assert_eq!(
            projections[1],
            "x6.favela_residents / NULLIF(base.population, 0) AS \"favela_population_rate\""
        );
        assert_eq!(
            favela.join_clause("x6", "base"),
            "LEFT JOIN \"ext_pop_res_favela\" x6 ON x6.\"join_key\" = base.\"municipality_code\""
        );
    }
}
