//! `/chat` request / response types.

use quarry_core::orchestrator::QueryFailure;
use quarry_core::{NarratedAnswer, Row};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Request body for `POST /chat/ask` and `POST /chat/ask/stream`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct AskRequest {
    /// The natural-language question.
    #[validate(length(min = 1, max = 1000, message = "must be between 1 and 1000 characters"))]
    #[schema(min_length = 1, max_length = 1000, example = "Show revenue breakdown by region")]
    pub message: String,
}

/// Why no rows were produced.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueryFailureBody {
    pub kind: String,
    pub message: String,
}

impl From<QueryFailure> for QueryFailureBody {
    fn from(f: QueryFailure) -> Self {
        Self {
            kind: f.kind,
            message: f.message,
        }
    }
}

/// Plan and result details shown next to the narrated answer.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TechnicalInsights {
    pub request_id: String,
    /// Generated SQL, if any.
    pub sql: Option<String>,
    pub explanation: Option<String>,
    /// Result rows in column order.
    #[schema(value_type = Vec<Object>)]
    pub results: Vec<Row>,
    pub row_count: usize,
    pub suggestions: Vec<String>,
    pub error: Option<QueryFailureBody>,
}

/// Response body for `POST /chat/ask`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AskResponse {
    /// Always `true`; failures use the error envelope.
    pub success: bool,
    /// Narrated answer.
    pub markdown: String,
    pub technical_insights: TechnicalInsights,
}

impl From<NarratedAnswer> for AskResponse {
    fn from(answer: NarratedAnswer) -> Self {
        let NarratedAnswer { response, markdown } = answer;
        let row_count = response.result.rows.len();
        Self {
            success: true,
            markdown,
            technical_insights: TechnicalInsights {
                request_id: response.plan.request_id,
                sql: response.plan.sql,
                explanation: response.plan.explanation,
                results: response.result.rows,
                row_count,
                suggestions: response.plan.suggestions,
                error: response.result.error.map(Into::into),
            },
        }
    }
}

/// Error envelope shared by every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Always `false`.
    pub success: bool,
    pub error: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_length_is_counted_in_characters() {
        let ok = AskRequest {
            message: "é".repeat(1000),
        };
        assert!(ok.validate().is_ok());

        let long = AskRequest {
            message: "a".repeat(1001),
        };
        assert!(long.validate().is_err());

        let empty = AskRequest {
            message: String::new(),
        };
        assert!(empty.validate().is_err());
    }
}
