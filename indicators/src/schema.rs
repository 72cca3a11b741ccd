use common::config::DirectoryRole;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// How the files of one logical source are found inside its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// Monthly extracts named `<stem>YYYYMM.<ext>`; only the target year is read.
    Snapshots { stem: &'static str },
    /// Every supported file in the directory is part of the source.
    Directory,
    /// A single file whose stem equals `stem` (case-insensitive).
    Named { stem: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Source is used as read.
    Keep,
    /// Latest snapshot wins: the latest row per primary key is kept, so a
    /// renamed entry never fans out a join.
    HistoryInsensitive {
        primary_key: &'static str,
        full_year: bool,
    },
    /// Latest occurrence in file-encounter order wins, no chronological sort.
    HistorySensitive,
    /// One row per facility identifier with first/last observed periods.
    Facility,
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: &'static str,
    pub role: DirectoryRole,
    pub layout: SourceLayout,
    pub dedup: DedupPolicy,
    /// Managing-code columns rewritten by the geo reconciler.
    pub geo_columns: &'static [&'static str],
    pub required_columns: &'static [&'static str],
    /// Columns added as typed nulls when a source file lacks them.
    pub optional_columns: &'static [&'static str],
}

impl SourceSpec {
    pub fn is_snapshot(&self) -> bool {
        matches!(self.layout, SourceLayout::Snapshots { .. })
    }
}

pub const FACILITY: &str = "facility";
pub const BED_COMPLEMENT: &str = "bed_complement";
pub const MUNICIPALITY: &str = "municipality";
pub const UNIT_TYPE: &str = "unit_type";
pub const ESTABLISHMENT_TYPE: &str = "establishment_type";
pub const ACTIVITY: &str = "activity";
pub const PROFESSIONAL_ACTIVITY: &str = "professional_activity";
pub const WORKLOAD: &str = "workload";
pub const CENSUS: &str = "census";
pub const MORTALITY: &str = "mortality";

/// External indicator tables, each one file in the `ibge` directory.
pub const EXTERNAL_TABLES: [&str; 9] = [
    "taxa_de_alfabetizacao",
    "taxa_coleta_lixo",
    "taxa_rede_esgoto",
    "anos_de_estudo",
    "taxa_populacao_nivel_instrucao",
    "pop_res_favela",
    "taxa_situacao_domicilio",
    "taxa_frequencia_escolar",
    "taxa_distribuicao_etaria",
];

/// Census numerics carried into the indicator table.
pub const CENSUS_NUMERIC_COLUMNS: [&str; 9] = [
    "populacao_residente",
    "idhm",
    "area_km2",
    "densidade_demografica",
    "escolarizacao_6_14",
    "mortalidade_infantil",
    "total_receitas_brutas_realizadas",
    "total_despesas_brutas_empenhadas",
    "pib_per_capita",
];

fn registry_sources() -> Vec<SourceSpec> {
    let mut sources = vec![
        SourceSpec {
            name: FACILITY,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbestabelecimento" },
            dedup: DedupPolicy::Facility,
            geo_columns: &["co_municipio_gestor"],
            required_columns: &[
                "co_unidade",
                "co_cnes",
                "co_municipio_gestor",
                "co_motivo_desab",
                "tp_unidade",
                "co_tipo_estabelecimento",
                "co_atividade_principal",
            ],
            optional_columns: &["no_fantasia", "no_razao_social", "tp_gestao"],
        },
        SourceSpec {
            name: BED_COMPLEMENT,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "rlestabcomplementar" },
            dedup: DedupPolicy::HistorySensitive,
            geo_columns: &[],
            required_columns: &["co_unidade", "qt_exist", "qt_sus"],
            optional_columns: &[],
        },
        SourceSpec {
            name: MUNICIPALITY,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbmunicipio" },
            dedup: DedupPolicy::HistoryInsensitive {
                primary_key: "co_municipio",
                full_year: true,
            },
            geo_columns: &[],
            required_columns: &["co_municipio", "no_municipio", "co_sigla_estado"],
            optional_columns: &[],
        },
        SourceSpec {
            name: UNIT_TYPE,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbtipounidade" },
            dedup: DedupPolicy::HistoryInsensitive {
                primary_key: "co_tipo_unidade",
                full_year: true,
            },
            geo_columns: &[],
            required_columns: &["co_tipo_unidade", "ds_tipo_unidade"],
            optional_columns: &[],
        },
        SourceSpec {
            name: ESTABLISHMENT_TYPE,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbtipoestabelecimento" },
            dedup: DedupPolicy::HistoryInsensitive {
                primary_key: "co_tipo_estabelecimento",
                full_year: true,
            },
            geo_columns: &[],
            required_columns: &["co_tipo_estabelecimento", "ds_tipo_estabelecimento"],
            optional_columns: &[],
        },
        SourceSpec {
            name: ACTIVITY,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbatividade" },
            dedup: DedupPolicy::HistoryInsensitive {
                primary_key: "co_atividade",
                full_year: true,
            },
            geo_columns: &[],
            required_columns: &["co_atividade", "ds_atividade"],
            optional_columns: &["ds_conceito_atividade"],
        },
        SourceSpec {
            name: PROFESSIONAL_ACTIVITY,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbatividadeprofissional" },
            dedup: DedupPolicy::HistorySensitive,
            geo_columns: &[],
            required_columns: &["co_cbo", "ds_atividade_profissional"],
            optional_columns: &[],
        },
        SourceSpec {
            name: WORKLOAD,
            role: DirectoryRole::Cnes,
            layout: SourceLayout::Snapshots { stem: "tbcargahorariasus" },
            dedup: DedupPolicy::HistorySensitive,
            geo_columns: &[],
            required_columns: &["co_unidade", "co_profissional_sus", "co_cbo"],
            optional_columns: &[],
        },
        SourceSpec {
            name: CENSUS,
            role: DirectoryRole::Cities,
            layout: SourceLayout::Directory,
            dedup: DedupPolicy::Keep,
            geo_columns: &[],
            required_columns: &["codigo_municipio", "nome", "uf", "populacao_residente"],
            optional_columns: &[
                "idhm",
                "area_km2",
                "densidade_demografica",
                "escolarizacao_6_14",
                "mortalidade_infantil",
                "total_receitas_brutas_realizadas",
                "total_despesas_brutas_empenhadas",
                "pib_per_capita",
            ],
        },
        SourceSpec {
            name: MORTALITY,
            role: DirectoryRole::Mortality,
            layout: SourceLayout::Directory,
            dedup: DedupPolicy::Keep,
            geo_columns: &["codmunocor"],
            required_columns: &["codestab", "codmunocor"],
            optional_columns: &[],
        },
    ];

    for table in EXTERNAL_TABLES {
        sources.push(SourceSpec {
            name: table,
            role: DirectoryRole::Ibge,
            layout: SourceLayout::Named { stem: table },
            dedup: DedupPolicy::Keep,
            geo_columns: &[],
            required_columns: &["codigo"],
            optional_columns: &[],
        });
    }

    sources
}

lazy_static! {
    static ref SOURCES: Vec<SourceSpec> = registry_sources();
    static ref SOURCES_BY_NAME: HashMap<&'static str, usize> = SOURCES
        .iter()
        .enumerate()
        .map(|(idx, spec)| (spec.name, idx))
        .collect();
}

pub fn all_sources() -> &'static [SourceSpec] {
    &SOURCES
}

pub fn get_source(name: &str) -> Option<&'static SourceSpec> {
    SOURCES_BY_NAME.get(name).map(|idx| &SOURCES[*idx])
}

/// Identifier columns stay text so leading zeros survive.
pub fn is_identifier_column(name: &str) -> bool {
    let upper = name.trim().to_ascii_uppercase();
    upper.starts_with("CO_")
        || upper.starts_with("TP_")
        || upper.starts_with("NU_")
        || matches!(
            upper.as_str(),
            "CODESTAB" | "CODMUNOCOR" | "CODMUNRES" | "CODIGO" | "CODIGO_MUNICIPIO"
        )
}
