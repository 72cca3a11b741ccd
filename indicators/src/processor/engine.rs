use super::geo::Reconciled;
use super::plan::{external_indicator_plan, IndicatorSource, JoinKind, KeyTransform};
use super::table::TableRegistry;
use crate::models::SourceTable;
use crate::schema::{
    ACTIVITY, BED_COMPLEMENT, CENSUS, ESTABLISHMENT_TYPE, FACILITY, MORTALITY, MUNICIPALITY,
    PROFESSIONAL_ACTIVITY, UNIT_TYPE, WORKLOAD,
};
use crate::utils::sql::{quote_ident, quote_literal};
use arrow::array::AsArray;
use arrow::compute::cast;
use arrow::datatypes::DataType;
use chrono::NaiveDate;
use common::Result;
use datafusion::dataframe::DataFrame;
use datafusion::prelude::SessionContext;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const UNKNOWN_UNIT_TYPE: &str = "DESCONHECIDO";
pub const UNIT_PREFIX: &str = "units_";

/// Views registered by [`AggregationEngine::build`], in execution order.
pub const VIEWS: [&str; 12] = [
    "beds",
    "facility_enriched",
    "facility_deaths",
    "municipal_deaths",
    "facility_counts",
    "bed_equipped",
    "socioeconomic_base",
    "roster",
    "physicians",
    "nurses",
    "facility_totals",
    "unit_type_pivot",
];

/// Composes the registered sources into the per-municipality indicator table.
pub struct AggregationEngine {
    ctx: Arc<SessionContext>,
    registry: Arc<dyn TableRegistry>,
    year: i32,
}

impl AggregationEngine {
    pub fn new(ctx: Arc<SessionContext>, registry: Arc<dyn TableRegistry>, year: i32) -> Self {
        Self { ctx, registry, year }
    }

    /// Only reconciled tables can be joined.
    pub async fn register_source(&self, table: &Reconciled<SourceTable>) -> Result<()> {
        self.registry
            .register_batches(&self.ctx, &table.name, table.schema(), vec![table.batch.clone()])
            .await?;
        debug!(table = %table.name, rows = table.num_rows(), "Registered source table");
        Ok(())
    }

    async fn register_view(&self, name: &str, sql: &str) -> Result<()> {
        debug!(view = name, sql, "Registering view");
        let df = self.ctx.sql(sql).await?;
        self.ctx.deregister_table(name)?;
        self.ctx.register_table(name, df.into_view())?;
        Ok(())
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let df = self.ctx.table(table).await?;
        Ok(df.schema().fields().iter().map(|f| f.name().clone()).collect())
    }

    fn december(&self) -> String {
        NaiveDate::from_ymd_opt(self.year, 12, 1)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }

    /// Registers every intermediate view and returns the final ordered table.
    pub async fn build(&self) -> Result<DataFrame> {
        let municipality_key = KeyTransform::MUNICIPALITY;

        // 1. December beds of active facilities.
        self.register_view(
            "beds",
            &format!(
                "SELECT b.co_unidade, \
                    SUM(TRY_CAST(b.qt_exist AS BIGINT)) AS existing_beds, \
                    SUM(TRY_CAST(b.qt_sus AS BIGINT)) AS sus_beds \
                 FROM {beds} b \
                 WHERE b.snapshot_period = DATE '{december}' \
                   AND b.co_unidade IN (SELECT co_unidade FROM {facility} WHERE active) \
                 GROUP BY b.co_unidade",
                beds = BED_COMPLEMENT,
                facility = FACILITY,
                december = self.december(),
            ),
        )
        .await?;

        // 2. Active facilities with their lookups and beds.
        self.register_view(
            "facility_enriched",
            &format!(
                "SELECT f.co_unidade, f.co_cnes, \
                    f.co_municipio_gestor AS municipality_code, \
                    m.co_sigla_estado AS state, m.no_municipio AS municipality_name, \
                    f.no_fantasia AS facility_name, \
                    tu.ds_tipo_unidade AS unit_type, \
                    te.ds_tipo_estabelecimento AS establishment_type, \
                    a.ds_atividade AS activity, \
                    b.existing_beds, b.sus_beds, \
                    f.first_observed, f.last_observed \
                 FROM {facility} f \
                 LEFT JOIN {municipality} m ON m.co_municipio = f.co_municipio_gestor \
                 LEFT JOIN {unit_type} tu ON tu.co_tipo_unidade = f.tp_unidade \
                 LEFT JOIN {establishment_type} te ON te.co_tipo_estabelecimento = f.co_tipo_estabelecimento \
                 LEFT JOIN {activity} a ON a.co_atividade = f.co_atividade_principal \
                 LEFT JOIN beds b ON b.co_unidade = f.co_unidade \
                 WHERE f.active",
                facility = FACILITY,
                municipality = MUNICIPALITY,
                unit_type = UNIT_TYPE,
                establishment_type = ESTABLISHMENT_TYPE,
                activity = ACTIVITY,
            ),
        )
        .await?;

        // 3. Deaths per facility; non-numeric establishment codes never match.
        self.register_view(
            "facility_deaths",
            &format!(
                "SELECT fe.*, d.deaths AS deaths_in_facility \
                 FROM facility_enriched fe \
                 LEFT JOIN ( \
                    SELECT establishment_id, COUNT(*) AS deaths \
                    FROM (SELECT TRY_CAST(codestab AS BIGINT) AS establishment_id FROM {mortality}) e \
                    GROUP BY establishment_id \
                 ) d ON TRY_CAST(fe.co_cnes AS BIGINT) = d.establishment_id",
                mortality = MORTALITY,
            ),
        )
        .await?;

        // 4. Deaths per occurrence municipality.
        self.register_view(
            "municipal_deaths",
            &format!(
                "SELECT m.co_municipio AS municipality_code, COUNT(*) AS total_deaths \
                 FROM (SELECT {occurrence} AS occurrence_code FROM {mortality}) o \
                 JOIN {municipality} m ON o.occurrence_code = m.co_municipio \
                 WHERE m.co_municipio IS NOT NULL \
                 GROUP BY m.co_municipio",
                occurrence = municipality_key.apply("codmunocor"),
                mortality = MORTALITY,
                municipality = MUNICIPALITY,
            ),
        )
        .await?;

        // 5. Active facilities per managing code.
        self.register_view(
            "facility_counts",
            &format!(
                "SELECT co_municipio_gestor AS municipality_code, \
                    COUNT(DISTINCT co_cnes) AS facility_count \
                 FROM {facility} \
                 WHERE active AND co_municipio_gestor IS NOT NULL \
                 GROUP BY co_municipio_gestor",
                facility = FACILITY,
            ),
        )
        .await?;

        // 6. Facilities with at least one existing bed.
        self.register_view(
            "bed_equipped",
            "SELECT municipality_code, COUNT(*) AS bed_equipped_facilities \
             FROM facility_enriched \
             WHERE existing_beds > 0 \
             GROUP BY municipality_code",
        )
        .await?;

        // 7. Census attributes of municipalities with active facilities.
        let census_code = municipality_key.apply("c.codigo_municipio");
        self.register_view(
            "socioeconomic_base",
            &format!(
                "SELECT CAST(c.uf AS VARCHAR) AS state, \
                    {census_code} AS municipality_code, \
                    CAST(c.nome AS VARCHAR) AS municipality_name, \
                    TRY_CAST(c.populacao_residente AS DOUBLE) AS population, \
                    TRY_CAST(c.idhm AS DOUBLE) AS hdi, \
                    TRY_CAST(c.area_km2 AS DOUBLE) AS area_km2, \
                    TRY_CAST(c.densidade_demografica AS DOUBLE) AS demographic_density, \
                    TRY_CAST(c.escolarizacao_6_14 AS DOUBLE) AS school_enrollment_6_14, \
                    TRY_CAST(c.mortalidade_infantil AS DOUBLE) AS infant_mortality, \
                    TRY_CAST(c.total_receitas_brutas_realizadas AS DOUBLE) AS gross_revenue, \
                    TRY_CAST(c.total_despesas_brutas_empenhadas AS DOUBLE) AS gross_expenses, \
                    TRY_CAST(c.pib_per_capita AS DOUBLE) AS gdp_per_capita, \
                    fc.facility_count \
                 FROM {census} c \
                 {join} facility_counts fc ON {census_code} = fc.municipality_code",
                census_code = census_code,
                census = CENSUS,
                join = JoinKind::Inner.as_sql(),
            ),
        )
        .await?;

        // 8. Professional assignments at active facilities.
        self.register_view(
            "roster",
            &format!(
                "SELECT w.co_unidade, \
                    w.co_profissional_sus AS professional_id, \
                    pa.ds_atividade_profissional AS professional_activity, \
                    m.co_municipio AS municipality_code \
                 FROM {workload} w \
                 JOIN {facility} f ON f.co_unidade = w.co_unidade \
                 JOIN {professional_activity} pa ON pa.co_cbo = w.co_cbo \
                 JOIN {municipality} m ON m.co_municipio = f.co_municipio_gestor \
                 WHERE f.active",
                workload = WORKLOAD,
                facility = FACILITY,
                professional_activity = PROFESSIONAL_ACTIVITY,
                municipality = MUNICIPALITY,
            ),
        )
        .await?;

        // 9. Distinct physicians and nurses per municipality.
        for (view, count, pattern) in [
            ("physicians", "physician_count", "%medic%"),
            ("nurses", "nurse_count", "%enfermei%"),
        ] {
            self.register_view(
                view,
                &format!(
                    "SELECT municipality_code, COUNT(DISTINCT professional_id) AS {count} \
                     FROM roster \
                     WHERE professional_activity ILIKE {pattern} \
                     GROUP BY municipality_code",
                    count = count,
                    pattern = quote_literal(pattern),
                ),
            )
            .await?;
        }

        self.register_view(
            "facility_totals",
            "SELECT municipality_code, \
                SUM(existing_beds) AS existing_beds, \
                SUM(sus_beds) AS sus_beds, \
                SUM(deaths_in_facility) AS deaths_in_facilities \
             FROM facility_deaths \
             GROUP BY municipality_code",
        )
        .await?;

        let pivot_columns = self.register_unit_type_pivot().await?;
        let plan = external_indicator_plan();
        self.register_external_views(&plan).await?;

        // 10. Final table.
        let sql = final_table_sql(&plan, &pivot_columns);
        let df = self.ctx.sql(&sql).await?;
        info!(views = VIEWS.len(), external = plan.len(), "Indicator table planned");
        Ok(df)
    }

    async fn register_external_views(&self, plan: &[IndicatorSource]) -> Result<()> {
        for source in plan {
            let available = self.table_columns(source.table).await?;
            let (sql, missing) = source.view_sql(&available);
            if !missing.is_empty() {
                warn!(table = source.table, ?missing, "Indicator columns absent, emitting nulls");
            }
            self.register_view(&source.view_name(), &sql).await?;
        }
        Ok(())
    }

    /// Registers `unit_type_pivot` and returns its count columns.
    async fn register_unit_type_pivot(&self) -> Result<Vec<String>> {
        let unit_type = format!("COALESCE(unit_type, {})", quote_literal(UNKNOWN_UNIT_TYPE));
        let batches = self
            .ctx
            .sql(&format!(
                "SELECT DISTINCT {} AS unit_type FROM facility_enriched",
                unit_type
            ))
            .await?
            .collect()
            .await?;

        let mut by_slug: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for batch in &batches {
            let values = cast(batch.column(0), &DataType::Utf8)?;
            for value in values.as_string::<i32>().iter().flatten() {
                by_slug
                    .entry(format!("{}{}", UNIT_PREFIX, slugify(value)))
                    .or_default()
                    .push(value.to_string());
            }
        }

        let mut projections = vec!["municipality_code".to_string()];
        for (column, labels) in &by_slug {
            let mut labels = labels.clone();
            labels.sort();
            let labels = labels
                .iter()
                .map(|l| quote_literal(l))
                .collect::<Vec<_>>()
                .join(", ");
            projections.push(format!(
                "SUM(CASE WHEN {} IN ({}) THEN 1 ELSE 0 END) AS {}",
                unit_type,
                labels,
                quote_ident(column)
            ));
        }

        self.register_view(
            "unit_type_pivot",
            &format!(
                "SELECT {} FROM facility_enriched GROUP BY municipality_code",
                projections.join(", ")
            ),
        )
        .await?;

        Ok(by_slug.into_keys().collect())
    }
}

/// Lowercase ASCII alphanumerics joined by `_`; Portuguese accents are folded.
pub fn slugify(label: &str) -> String {
    let folded: String = label
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    let slug = folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    if slug.is_empty() {
        "other".to_string()
    } else {
        slug
    }
}

/// `numerator * 1000 / population`, null when the population is zero or null.
fn per_thousand(numerator: &str) -> String {
    format!("CAST({} AS DOUBLE) * 1000 / NULLIF(base.population, 0)", numerator)
}

/// `numerator / denominator` with the denominator cast and guarded.
fn ratio(numerator: &str, denominator: &str) -> String {
    format!(
        "CAST({} AS DOUBLE) / NULLIF(CAST({} AS DOUBLE), 0)",
        numerator, denominator
    )
}

fn final_table_sql(plan: &[IndicatorSource], pivot_columns: &[String]) -> String {
    let existing_beds = "COALESCE(ft.existing_beds, 0)";
    let sus_beds = "COALESCE(ft.sus_beds, 0)";
    let bed_equipped = "COALESCE(be.bed_equipped_facilities, 0)";
    let facility_deaths = "COALESCE(ft.deaths_in_facilities, 0)";
    let total_deaths = "COALESCE(md.total_deaths, 0)";

    let mut columns: Vec<String> = vec![
        "base.state".into(),
        "base.municipality_code".into(),
        "base.municipality_name".into(),
        "base.population".into(),
        "base.hdi".into(),
        "base.area_km2".into(),
        "base.demographic_density".into(),
        "base.school_enrollment_6_14".into(),
        "base.infant_mortality".into(),
        "base.gross_revenue".into(),
        "base.gross_expenses".into(),
        "base.gdp_per_capita".into(),
        "base.facility_count".into(),
        format!("{} AS inhabitants_per_facility", ratio("base.population", "base.facility_count")),
        format!("{} AS facility_density_per_k", per_thousand("base.facility_count")),
        "ph.physician_count".into(),
        format!("{} AS physician_density_per_k", per_thousand("ph.physician_count")),
        format!("{} AS inhabitants_per_physician", ratio("base.population", "ph.physician_count")),
        "nu.nurse_count".into(),
        format!("{} AS nurse_density_per_k", per_thousand("nu.nurse_count")),
        format!("{} AS inhabitants_per_nurse", ratio("base.population", "nu.nurse_count")),
        format!("{} AS existing_beds", existing_beds),
        format!("{} AS bed_density_per_k", per_thousand(existing_beds)),
        format!("{} AS beds_per_facility", ratio(existing_beds, "base.facility_count")),
        format!("{} AS sus_beds", sus_beds),
        format!("{} AS sus_bed_density_per_k", per_thousand(sus_beds)),
        format!("{} AS sus_beds_per_facility", ratio(sus_beds, "base.facility_count")),
        format!("{} AS bed_equipped_facilities", bed_equipped),
        format!("{} AS bed_equipped_facility_density_per_k", per_thousand(bed_equipped)),
        format!("{} AS deaths_in_facilities", facility_deaths),
        format!("{} AS deaths_per_facility", ratio(facility_deaths, "base.facility_count")),
        format!("{} AS total_deaths", total_deaths),
        format!("{} AS general_mortality_rate", per_thousand(total_deaths)),
    ];

    let mut joins = vec![
        "LEFT JOIN facility_totals ft ON ft.municipality_code = base.municipality_code".to_string(),
        "LEFT JOIN municipal_deaths md ON md.municipality_code = base.municipality_code".to_string(),
    ];

    for (idx, source) in plan.iter().enumerate() {
        let alias = format!("x{}", idx);
        columns.extend(source.projections(&alias, "base"));
        joins.push(source.join_clause(&alias, "base"));
    }

    joins.push("LEFT JOIN physicians ph ON ph.municipality_code = base.municipality_code".into());
    joins.push("LEFT JOIN nurses nu ON nu.municipality_code = base.municipality_code".into());
    joins.push("LEFT JOIN bed_equipped be ON be.municipality_code = base.municipality_code".into());
    joins.push("LEFT JOIN unit_type_pivot up ON up.municipality_code = base.municipality_code".into());

    for column in pivot_columns {
        let column = quote_ident(column);
        columns.push(format!("COALESCE(up.{0}, 0) AS {0}", column));
    }

    format!(
        "SELECT {} FROM socioeconomic_base base {} ORDER BY base.municipality_code",
        columns.join(", "),
        joins.join(" ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::table::SessionTableRegistry;
    use crate::utils::sql::scalar_count;

    #[tokio::test]
    async fn test_register_view_replaces_previous_definition() {
        let engine = AggregationEngine::new(
            Arc::new(SessionContext::new()),
            Arc::new(SessionTableRegistry),
            2022,
        );
        engine.register_view("beds", "SELECT 1 AS n").await.unwrap();
        engine
            .register_view("beds", "SELECT 1 AS n UNION ALL SELECT 2 AS n")
            .await
            .unwrap();

        let rows = scalar_count(&engine.ctx, "SELECT COUNT(*) FROM beds").await.unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("POSTO DE SAUDE"), "posto_de_saude");
        assert_eq!(slugify("CENTRO DE SAÚDE/UNIDADE BÁSICA"), "centro_de_saude_unidade_basica");
        assert_eq!(slugify("DESCONHECIDO"), "desconhecido");
        assert_eq!(slugify("---"), "other");
    }

    #[test]
    fn test_rates_guard_denominators() {
        assert_eq!(
            per_thousand("ph.physician_count"),
            "CAST(ph.physician_count AS DOUBLE) * 1000 / NULLIF(base.population, 0)"
        );
        assert_eq!(
            ratio("base.population", "base.facility_count"),
            "CAST(base.population AS DOUBLE) / NULLIF(CAST(base.facility_count AS DOUBLE), 0)"
        );
    }

    #[test]
    fn test_final_sql_orders_by_municipality() {
        let sql = final_table_sql(&external_indicator_plan(), &["units_posto_de_saude".to_string()]);
        assert!(sql.ends_with("ORDER BY base.municipality_code"));
        assert!(sql.contains("COALESCE(up.\"units_posto_de_saude\", 0) AS \"units_posto_de_saude\""));
        assert!(sql.contains("LEFT JOIN \"ext_taxa_de_alfabetizacao\" x0"));
    }
}
