//! Prompt templates

/// Returned when retrieval finds nothing to answer from
pub const FAIL_RESPONSE: &str = "Sorry, I'm not able to provide an answer to that question.";

pub const EXTRACTION_SYSTEM: &str = "You extract a knowledge graph from text. \
Output MUST be a single JSON object matching the requested schema. No prose, no markdown.";

pub fn entity_extraction(text: &str, entity_types: &[String]) -> String {
    format!(
        r#"-Goal-
Given a text document and a list of entity types, identify all entities of those types in the text and all relationships among the identified entities.

-Steps-
1. Identify all entities. For each entity give:
- name: name of the entity, capitalized
- type: one of [{types}]
- description: comprehensive description of the entity's attributes and activities
2. Among the entities from step 1, identify all pairs (source, target) that are clearly related. For each pair give:
- source: name of the source entity
- target: name of the target entity
- description: why the two entities are related
- weight: a number from 1 to 10 indicating the strength of the relationship

Return ONLY valid JSON with this schema:
{{"entities":[{{"name":string,"type":string,"description":string}}],"relationships":[{{"source":string,"target":string,"description":string,"weight":number}}]}}

-Text-
{text}"#,
        types = entity_types.join(", "),
        text = text
    )
}

pub const GLEANING_CONTINUE: &str = "MANY entities were missed in the last extraction. \
Add them below using the same JSON format. Only include entities and relationships not already listed.";

pub const GLEANING_IF_LOOP: &str = "It appears some entities may have still been missed. \
Answer YES or NO if there are still entities that need to be added.";

pub fn summarize_descriptions(name: &str, descriptions: &[String]) -> String {
    format!(
        r#"You are a helpful assistant responsible for generating a comprehensive summary of the data provided below.
Given one or two entities, and a list of descriptions, all related to the same entity or group of entities.
Please concatenate all of these into a single, comprehensive description. Make sure to include information collected from all the descriptions.
If the provided descriptions are contradictory, please resolve the contradictions and provide a single, coherent summary.
Make sure it is written in third person, and include the entity names so we have the full context.

-Data-
Entities: {name}
Description List: {list}

Output:"#,
        name = name,
        list = descriptions.join("\n")
    )
}

pub fn community_report(context: &str) -> String {
    format!(
        r#"You are an AI assistant that helps a human analyst perform general information discovery within a network of entities.

Write a comprehensive report of a community, given a list of entities that belong to the community as well as their relationships.

Return ONLY valid JSON with this schema:
{{"title":string,"summary":string,"rating":number,"rating_explanation":string,"findings":[{{"summary":string,"explanation":string}}]}}

- title: short but specific name of the community, with representative named entities
- summary: executive summary of the community's overall structure and its key entities
- rating: float between 0 and 10 for the impact severity of the entities within the community
- rating_explanation: a single sentence explaining the rating
- findings: 5-10 key insights about the community

-Data-
{context}

Output:"#,
        context = context
    )
}

pub fn global_map_system(context: &str) -> String {
    format!(
        r#"---Role---
You are a helpful assistant responding to questions about data in the tables provided.

---Goal---
Generate a response consisting of a list of key points that responds to the user's question, summarizing all relevant information in the input data tables.
If you don't know the answer or the tables do not contain enough information, say so. Do not make anything up.

Each key point has:
- description: a comprehensive description of the point
- score: an integer from 0 to 100 for how important the point is in answering the question; an "I don't know" point scores 0

Return ONLY valid JSON:
{{"points":[{{"description":string,"score":number}}]}}

---Data tables---
{context}"#,
        context = context
    )
}

pub fn global_reduce_system(report_data: &str, response_type: &str) -> String {
    format!(
        r#"---Role---
You are a helpful assistant responding to questions about a dataset by synthesizing perspectives from multiple analysts.

---Goal---
Generate a response of the target length and format that responds to the user's question, summarizing all the reports from multiple analysts who focused on different parts of the dataset.
The analysts' reports are ranked in descending order of importance.
Remove irrelevant information, merge the relevant points into a comprehensive answer, and do not make anything up.

---Target response length and format---
{response_type}

---Analyst Reports---
{report_data}"#,
        response_type = response_type,
        report_data = report_data
    )
}

pub fn local_rag_system(context: &str, response_type: &str) -> String {
    format!(
        r#"---Role---
You are a helpful assistant responding to questions about data in the tables provided.

---Goal---
Generate a response of the target length and format that responds to the user's question, summarizing all information in the input data tables appropriate for the response length and format.
If you don't know the answer, just say so. Do not make anything up.

---Target response length and format---
{response_type}

---Data tables---
{context}"#,
        response_type = response_type,
        context = context
    )
}

pub fn naive_rag_system(content: &str, response_type: &str) -> String {
    format!(
        r#"You're a helpful assistant
Below is the knowledge you know:
{content}
---
If you don't know the answer or if the provided knowledge does not contain sufficient information to provide an answer, just say so. Do not make anything up.
Generate a response of the target length and format that responds to the user's question.
---Target response length and format---
{response_type}"#,
        content = content,
        response_type = response_type
    )
}
