//! Decoding of mortality classifier codes into readable labels.

use crate::utils::sql::{quote_ident, quote_literal};

pub struct Classifier {
    pub column: &'static str,
    pub labels: &'static [(&'static str, &'static str)],
    pub fallback: &'static str,
}

pub const CLASSIFIERS: &[Classifier] = &[
    Classifier {
        column: "sexo",
        labels: &[("0", "Ignorado"), ("1", "Masculino"), ("2", "Feminino")],
        fallback: "Desconhecido",
    },
    Classifier {
        column: "racacor",
        labels: &[
            ("1", "Branca"),
            ("2", "Preta"),
            ("3", "Amarela"),
            ("4", "Parda"),
            ("5", "Indígena"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "estciv",
        labels: &[
            ("1", "Solteiro"),
            ("2", "Casado"),
            ("3", "Viúvo"),
            ("4", "Separado/Divorciado"),
            ("5", "União estável"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "esc2010",
        labels: &[
            ("0", "Sem escolaridade"),
            ("1", "Fundamental I"),
            ("2", "Fundamental II"),
            ("3", "Médio"),
            ("4", "Superior incompleto"),
            ("5", "Superior completo"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "lococor",
        labels: &[
            ("1", "Hospital"),
            ("2", "Outros estabelecimentos de saúde"),
            ("3", "Domicílio"),
            ("4", "Via pública"),
            ("5", "Outros"),
            ("6", "Aldeia indígena"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "gravidez",
        labels: &[("1", "Única"), ("2", "Dupla"), ("3", "Tripla ou mais")],
        fallback: "Ignorado",
    },
    Classifier {
        column: "parto",
        labels: &[("1", "Vaginal"), ("2", "Cesáreo")],
        fallback: "Ignorado",
    },
    Classifier {
        column: "obitoparto",
        labels: &[("1", "Antes"), ("2", "Durante"), ("3", "Depois")],
        fallback: "Ignorado",
    },
    Classifier {
        column: "tpmorteoco",
        labels: &[
            ("1", "Gravidez"),
            ("2", "Parto"),
            ("3", "Abortamento"),
            ("4", "Até 42 dias pós-parto"),
            ("5", "43 dias a 1 ano pós-parto"),
            ("8", "Não ocorreu neste período"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "circobito",
        labels: &[
            ("1", "Acidente"),
            ("2", "Suicídio"),
            ("3", "Homicídio"),
            ("4", "Outros"),
        ],
        fallback: "Ignorado",
    },
    Classifier {
        column: "acidtrab",
        labels: &[("1", "Sim"), ("2", "Não")],
        fallback: "Ignorado",
    },
    Classifier {
        column: "fonte",
        labels: &[
            ("1", "Ocorrência policial"),
            ("2", "Hospital"),
            ("3", "Família"),
            ("4", "Outra"),
        ],
        fallback: "Ignorado",
    },
];

impl Classifier {
    pub fn case_expr(&self, alias: &str) -> String {
        let column = format!("{}.{}", alias, quote_ident(self.column));
        let branches = self
            .labels
            .iter()
            .map(|(code, label)| format!("WHEN {} THEN {}", quote_literal(code), quote_literal(label)))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "CASE TRIM(CAST({} AS VARCHAR)) {} ELSE {} END",
            column,
            branches,
            quote_literal(self.fallback)
        )
    }
}

pub fn find_classifier(column: &str) -> Option<&'static Classifier> {
    CLASSIFIERS.iter().find(|c| c.column == column)
}

/// Query over the `mortality` table with classifier columns decoded and the
/// occurrence municipality's name and state attached.
pub fn decoded_mortality_sql(columns: &[String]) -> String {
    let projections: Vec<String> = columns
        .iter()
        .map(|column| match find_classifier(column) {
            Some(classifier) => format!("{} AS {}", classifier.case_expr("o"), quote_ident(column)),
            None => format!("o.{}", quote_ident(column)),
        })
        .collect();

    format!(
        "SELECT {}, m.no_municipio AS occurrence_municipality, m.co_sigla_estado AS occurrence_state \
         FROM mortality o \
         LEFT JOIN municipality m ON substr(CAST(o.codmunocor AS VARCHAR), 1, 6) = m.co_municipio",
        projections.join(", ")
    )
}
