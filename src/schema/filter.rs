// ABOUTME: Removes object kinds from a plain pg_dump schema script
// ABOUTME: Works on pg_dump's "-- Name: ...; Type: ...;" entry headers, so output order is preserved

use std::collections::HashSet;

use crate::models::SchemaExportOptions;

/// Object kinds the export can leave out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterOptions {
    pub comments: bool,
    pub indexes: bool,
    pub constraints: bool,
    pub triggers: bool,
    pub sequences: bool,
    pub types: bool,
    pub functions: bool,
    pub views: bool,
}

impl From<&SchemaExportOptions> for FilterOptions {
    fn from(options: &SchemaExportOptions) -> Self {
        Self {
            comments: options.include_comments,
            indexes: options.include_indexes,
            constraints: options.include_constraints,
            triggers: options.include_triggers,
            sequences: options.include_sequences,
            types: options.include_types,
            functions: options.include_functions,
            views: options.include_views,
        }
    }
}

impl FilterOptions {
    pub fn keeps_everything(&self) -> bool {
        self.comments
            && self.indexes
            && self.constraints
            && self.triggers
            && self.sequences
            && self.types
            && self.functions
            && self.views
    }

    fn allows(&self, class: ObjectClass) -> bool {
        match class {
            ObjectClass::Comment => self.comments,
            ObjectClass::Index => self.indexes,
            ObjectClass::Constraint => self.constraints,
            ObjectClass::Trigger => self.triggers,
            ObjectClass::Sequence => self.sequences,
            ObjectClass::Type => self.types,
            ObjectClass::Function => self.functions,
            ObjectClass::View => self.views,
            ObjectClass::Acl | ObjectClass::Default | ObjectClass::Other => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectClass {
    Comment,
    Acl,
    Index,
    Constraint,
    Trigger,
    Sequence,
    Default,
    Type,
    Function,
    View,
    Other,
}

fn class_of_kind(kind: &str) -> ObjectClass {
    match kind {
        "COMMENT" => ObjectClass::Comment,
        "ACL" => ObjectClass::Acl,
        "INDEX" | "INDEX ATTACH" => ObjectClass::Index,
        "CONSTRAINT" | "FK CONSTRAINT" | "CHECK CONSTRAINT" => ObjectClass::Constraint,
        "TRIGGER" | "EVENT TRIGGER" => ObjectClass::Trigger,
        "SEQUENCE" | "SEQUENCE OWNED BY" | "SEQUENCE SET" => ObjectClass::Sequence,
        "DEFAULT" => ObjectClass::Default,
        "TYPE" | "SHELL TYPE" | "DOMAIN" => ObjectClass::Type,
        "FUNCTION" | "PROCEDURE" | "AGGREGATE" => ObjectClass::Function,
        "VIEW" | "MATERIALIZED VIEW" | "MATERIALIZED VIEW DATA" => ObjectClass::View,
        _ => ObjectClass::Other,
    }
}

/// COMMENT and ACL entries are named after their target, e.g.
/// `FUNCTION touch(integer)` or `COLUMN users.email`.
fn class_of_target(name: &str) -> ObjectClass {
    const PREFIXES: [(&str, ObjectClass); 11] = [
        ("MATERIALIZED VIEW ", ObjectClass::View),
        ("VIEW ", ObjectClass::View),
        ("FUNCTION ", ObjectClass::Function),
        ("PROCEDURE ", ObjectClass::Function),
        ("AGGREGATE ", ObjectClass::Function),
        ("TYPE ", ObjectClass::Type),
        ("DOMAIN ", ObjectClass::Type),
        ("SEQUENCE ", ObjectClass::Sequence),
        ("INDEX ", ObjectClass::Index),
        ("CONSTRAINT ", ObjectClass::Constraint),
        ("TRIGGER ", ObjectClass::Trigger),
    ];
    if name.starts_with("EVENT TRIGGER ") {
        return ObjectClass::Trigger;
    }
    PREFIXES
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|(_, class)| *class)
        .unwrap_or(ObjectClass::Other)
}

/// Relation a `TABLE x` or `COLUMN x.y` target refers to. pg_dump names
/// view grants `TABLE <view>`.
fn target_relation(name: &str) -> Option<&str> {
    if let Some(rest) = name.strip_prefix("TABLE ") {
        return Some(rest);
    }
    name.strip_prefix("COLUMN ")
        .and_then(|rest| rest.split_once('.'))
        .map(|(relation, _)| relation)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryHeader {
    name: String,
    kind: String,
    schema: String,
}

fn parse_header(line: &str) -> Option<EntryHeader> {
    let rest = line.strip_prefix("-- Name: ")?;
    let (name, rest) = rest.split_once("; Type: ")?;
    let (kind, rest) = rest.split_once("; Schema: ")?;
    let schema = rest.split_once("; ").map(|(s, _)| s).unwrap_or(rest);
    Some(EntryHeader {
        name: name.to_string(),
        kind: kind.to_string(),
        schema: schema.to_string(),
    })
}

/// A comment block is `--`, one or more `-- text` lines, then `--`.
/// Returns the index just past the block and its entry header, if any.
fn comment_block(lines: &[&str], start: usize) -> Option<(usize, Option<EntryHeader>)> {
    if lines.get(start) != Some(&"--") {
        return None;
    }
    let mut end = start + 1;
    while lines.get(end).is_some_and(|l| l.starts_with("-- ")) {
        end += 1;
    }
    if end == start + 1 || lines.get(end) != Some(&"--") {
        return None;
    }
    let header = lines[start + 1..end].iter().find_map(|l| parse_header(l));
    Some((end + 1, header))
}

struct Segment<'a> {
    header: Option<EntryHeader>,
    lines: &'a [&'a str],
}

impl Segment<'_> {
    fn class(&self) -> ObjectClass {
        self.header
            .as_ref()
            .map(|h| class_of_kind(&h.kind))
            .unwrap_or(ObjectClass::Other)
    }

    fn body_contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

/// Split at every comment block. Text before the first block (and blocks
/// without an entry header, like the closing banner) stay unclassified.
fn segments<'a>(lines: &'a [&'a str]) -> Vec<Segment<'a>> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut header = None;
    let mut i = 0;
    while i < lines.len() {
        match comment_block(lines, i) {
            Some((next, next_header)) => {
                if i > start {
                    segments.push(Segment {
                        header: header.take(),
                        lines: &lines[start..i],
                    });
                }
                start = i;
                header = next_header;
                i = next;
            }
            None => i += 1,
        }
    }
    if start < lines.len() {
        segments.push(Segment {
            header,
            lines: &lines[start..],
        });
    }
    segments
}

/// Drop the entries `options` excludes. Comments and grants on a dropped
/// object go with it, as do column defaults that draw from a dropped sequence.
pub fn filter_dump(sql: &str, options: &FilterOptions) -> String {
    if options.keeps_everything() {
        return sql.to_string();
    }

    let lines: Vec<&str> = sql.lines().collect();
    let segments = segments(&lines);

    let dropped_views: HashSet<(String, String)> = if options.views {
        HashSet::new()
    } else {
        segments
            .iter()
            .filter(|s| s.class() == ObjectClass::View)
            .filter_map(|s| s.header.as_ref())
            .map(|h| (h.schema.clone(), h.name.clone()))
            .collect()
    };

    let keep = |segment: &Segment<'_>| -> bool {
        let Some(header) = &segment.header else {
            return true;
        };
        match class_of_kind(&header.kind) {
            ObjectClass::Comment | ObjectClass::Acl => {
                let class = class_of_kind(&header.kind);
                if class == ObjectClass::Comment && !options.comments {
                    return false;
                }
                let on_dropped_view = target_relation(&header.name)
                    .is_some_and(|rel| dropped_views.contains(&(header.schema.clone(), rel.to_string())));
                options.allows(class_of_target(&header.name)) && !on_dropped_view
            }
            ObjectClass::Default => options.sequences || !segment.body_contains("nextval("),
            class => options.allows(class),
        }
    };

    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for segment in &segments {
        if keep(segment) {
            out.extend_from_slice(segment.lines);
        }
    }
    let mut filtered = out.join("\n");
    if sql.ends_with('\n') && !filtered.is_empty() {
        filtered.push('\n');
    }
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "--
-- PostgreSQL database dump
--

-- Dumped from database version 16.2
-- Dumped by pg_dump version 16.2

SET statement_timeout = 0;
SET client_encoding = 'UTF8';

--
-- Name: mood; Type: TYPE; Schema: public; Owner: postgres
--

CREATE TYPE public.mood AS ENUM (
    'sad',
    'happy'
);


ALTER TYPE public.mood OWNER TO postgres;

--
-- Name: touch_updated_at(); Type: FUNCTION; Schema: public; Owner: postgres
--

CREATE FUNCTION public.touch_updated_at() RETURNS trigger
    LANGUAGE plpgsql
    AS $$
BEGIN
    NEW.updated_at = now();
    RETURN NEW;
END;
$$;


--
-- Name: FUNCTION touch_updated_at(); Type: COMMENT; Schema: public; Owner: postgres
--

COMMENT ON FUNCTION public.touch_updated_at() IS 'Keeps updated_at current';


--
-- Name: users; Type: TABLE; Schema: public; Owner: postgres
--

CREATE TABLE public.users (
    id integer NOT NULL,
    email text NOT NULL,
    mood public.mood,
    updated_at timestamp with time zone
);


--
-- Name: TABLE users; Type: COMMENT; Schema: public; Owner: postgres
--

COMMENT ON TABLE public.users IS 'Registered users';


--
-- Name: users_id_seq; Type: SEQUENCE; Schema: public; Owner: postgres
--

CREATE SEQUENCE public.users_id_seq
    AS integer
    START WITH 1
    INCREMENT BY 1
    CACHE 1;


--
-- Name: users_id_seq; Type: SEQUENCE OWNED BY; Schema: public; Owner: postgres
--

ALTER SEQUENCE public.users_id_seq OWNED BY public.users.id;


--
-- Name: active_users; Type: VIEW; Schema: public; Owner: postgres
--

CREATE VIEW public.active_users AS
 SELECT id, email FROM public.users;


--
-- Name: VIEW active_users; Type: COMMENT; Schema: public; Owner: postgres
--

COMMENT ON VIEW public.active_users IS 'Users seen recently';


--
-- Name: COLUMN active_users.email; Type: COMMENT; Schema: public; Owner: postgres
--

COMMENT ON COLUMN public.active_users.email IS 'Login address';


--
-- Name: users id; Type: DEFAULT; Schema: public; Owner: postgres
--

ALTER TABLE ONLY public.users ALTER COLUMN id SET DEFAULT nextval('public.users_id_seq'::regclass);


--
-- Name: users users_pkey; Type: CONSTRAINT; Schema: public; Owner: postgres
--

ALTER TABLE ONLY public.users
    ADD CONSTRAINT users_pkey PRIMARY KEY (id);


--
-- Name: users_email_idx; Type: INDEX; Schema: public; Owner: postgres
--

CREATE INDEX users_email_idx ON public.users USING btree (email);


--
-- Name: users users_touch; Type: TRIGGER; Schema: public; Owner: postgres
--

CREATE TRIGGER users_touch BEFORE UPDATE ON public.users FOR EACH ROW EXECUTE FUNCTION public.touch_updated_at();


--
-- Name: TABLE active_users; Type: ACL; Schema: public; Owner: postgres
--

GRANT SELECT ON TABLE public.active_users TO reporting;


--
-- Name: TABLE users; Type: ACL; Schema: public; Owner: postgres
--

GRANT SELECT ON TABLE public.users TO reporting;


--
-- PostgreSQL database dump complete
--

";

    fn all() -> FilterOptions {
        FilterOptions::from(&SchemaExportOptions::new("p"))
    }

    #[test]
    fn test_everything_included_is_untouched() {
        assert_eq!(filter_dump(DUMP, &all()), DUMP);
    }

    #[test]
    fn test_without_views_drops_dependent_comments_and_grants() {
        let out = filter_dump(DUMP, &FilterOptions { views: false, ..all() });
        assert!(!out.contains("CREATE VIEW"));
        assert!(!out.contains("COMMENT ON VIEW"));
        assert!(!out.contains("COMMENT ON COLUMN public.active_users"));
        assert!(!out.contains("public.active_users TO reporting"));
        assert!(out.contains("GRANT SELECT ON TABLE public.users TO reporting;"));
        assert!(out.contains("COMMENT ON TABLE public.users"));
        assert!(out.contains("CREATE TABLE public.users"));
    }

    #[test]
    fn test_without_comments() {
        let out = filter_dump(DUMP, &FilterOptions { comments: false, ..all() });
        assert!(!out.contains("COMMENT ON"));
        assert!(out.contains("CREATE VIEW public.active_users"));
        assert!(out.contains("CREATE FUNCTION public.touch_updated_at()"));
    }

    #[test]
    fn test_without_sequences_drops_nextval_defaults() {
        let out = filter_dump(DUMP, &FilterOptions { sequences: false, ..all() });
        assert!(!out.contains("CREATE SEQUENCE"));
        assert!(!out.contains("OWNED BY"));
        assert!(!out.contains("nextval("));
        assert!(out.contains("CREATE TABLE public.users"));
    }

    #[test]
    fn test_without_functions_drops_their_comments() {
        let out = filter_dump(DUMP, &FilterOptions { functions: false, ..all() });
        assert!(!out.contains("CREATE FUNCTION"));
        assert!(!out.contains("COMMENT ON FUNCTION"));
        assert!(out.contains("CREATE TRIGGER users_touch"));
    }

    #[test]
    fn test_individual_kinds() {
        let out = filter_dump(DUMP, &FilterOptions { indexes: false, ..all() });
        assert!(!out.contains("CREATE INDEX"));
        let out = filter_dump(DUMP, &FilterOptions { constraints: false, ..all() });
        assert!(!out.contains("ADD CONSTRAINT"));
        let out = filter_dump(DUMP, &FilterOptions { triggers: false, ..all() });
        assert!(!out.contains("CREATE TRIGGER"));
        let out = filter_dump(DUMP, &FilterOptions { types: false, ..all() });
        assert!(!out.contains("CREATE TYPE"));
        assert!(out.contains("mood public.mood"));
    }

    #[test]
    fn test_preamble_and_banner_always_kept() {
        let none = FilterOptions {
            comments: false,
            indexes: false,
            constraints: false,
            triggers: false,
            sequences: false,
            types: false,
            functions: false,
            views: false,
        };
        let out = filter_dump(DUMP, &none);
        assert!(out.starts_with("--\n-- PostgreSQL database dump\n--\n"));
        assert!(out.contains("SET client_encoding = 'UTF8';"));
        assert!(out.trim_end().ends_with("-- PostgreSQL database dump complete\n--"));
        assert!(out.contains("CREATE TABLE public.users"));
        assert_eq!(filter_dump(DUMP, &none), out);
    }

    #[test]
    fn test_parse_header() {
        let header =
            parse_header("-- Name: users users_pkey; Type: FK CONSTRAINT; Schema: public; Owner: app")
                .unwrap();
        assert_eq!(header.name, "users users_pkey");
        assert_eq!(header.kind, "FK CONSTRAINT");
        assert_eq!(header.schema, "public");
        assert!(parse_header("-- Dumped by pg_dump version 16.2").is_none());
    }
}
