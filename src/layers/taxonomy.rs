// Static arXiv subject classification: topic -> archive code -> subjects.
use strsim::levenshtein;

#[derive(Debug, PartialEq, Eq)]
pub struct Subject {
    pub name: &'static str,
    pub code: &'static str,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Subjects {
    Listed(&'static [Subject]),
    /// The archive has no sub-categories; the whole archive is searched.
    Unconstrained,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Topic {
    pub name: &'static str,
    pub archive: &'static str,
    pub subjects: Subjects,
}

// Edit distance under which an unknown subject gets a "did you mean" hint.
const SUGGESTION_DISTANCE: usize = 4;

macro_rules! subjects {
    ($($name:literal => $code:literal),+ $(,)?) => {
        Subjects::Listed(&[$(Subject { name: $name, code: $code }),+])
    };
}

pub static TOPICS: &[Topic] = &[
    Topic {
        name: "Astrophysics",
        archive: "astro-ph",
        subjects: subjects! {
            "Astrophysics of Galaxies" => "astro-ph.GA",
            "Cosmology and Nongalactic Astrophysics" => "astro-ph.CO",
            "Earth and Planetary Astrophysics" => "astro-ph.EP",
            "High Energy Astrophysical Phenomena" => "astro-ph.HE",
            "Instrumentation and Methods for Astrophysics" => "astro-ph.IM",
            "Solar and Stellar Astrophysics" => "astro-ph.SR",
        },
    },
    Topic {
        name: "Condensed Matter",
        archive: "cond-mat",
        subjects: subjects! {
            "Disordered Systems and Neural Networks" => "cond-mat.dis-nn",
            "Materials Science" => "cond-mat.mtrl-sci",
            "Mesoscale and Nanoscale Physics" => "cond-mat.mes-hall",
            "Other Condensed Matter" => "cond-mat.other",
            "Quantum Gases" => "cond-mat.quant-gas",
            "Soft Condensed Matter" => "cond-mat.soft",
            "Statistical Mechanics" => "cond-mat.stat-mech",
            "Strongly Correlated Electrons" => "cond-mat.str-el",
            "Superconductivity" => "cond-mat.supr-con",
        },
    },
    Topic {
        name: "General Relativity and Quantum Cosmology",
        archive: "gr-qc",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "High Energy Physics - Experiment",
        archive: "hep-ex",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "High Energy Physics - Lattice",
        archive: "hep-lat",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "High Energy Physics - Phenomenology",
        archive: "hep-ph",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "High Energy Physics - Theory",
        archive: "hep-th",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "Mathematical Physics",
        archive: "math-ph",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "Nonlinear Sciences",
        archive: "nlin",
        subjects: subjects! {
            "Adaptation and Self-Organizing Systems" => "nlin.AO",
            "Cellular Automata and Lattice Gases" => "nlin.CG",
            "Chaotic Dynamics" => "nlin.CD",
            "Exactly Solvable and Integrable Systems" => "nlin.SI",
            "Pattern Formation and Solitons" => "nlin.PS",
        },
    },
    Topic {
        name: "Nuclear Experiment",
        archive: "nucl-ex",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "Nuclear Theory",
        archive: "nucl-th",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "Physics",
        archive: "physics",
        subjects: subjects! {
            "Accelerator Physics" => "physics.acc-ph",
            "Applied Physics" => "physics.app-ph",
            "Atmospheric and Oceanic Physics" => "physics.ao-ph",
            "Atomic and Molecular Clusters" => "physics.atm-clus",
            "Atomic Physics" => "physics.atom-ph",
            "Biological Physics" => "physics.bio-ph",
            "Chemical Physics" => "physics.chem-ph",
            "Classical Physics" => "physics.class-ph",
            "Computational Physics" => "physics.comp-ph",
            "Data Analysis, Statistics and Probability" => "physics.data-an",
            "Fluid Dynamics" => "physics.flu-dyn",
            "General Physics" => "physics.gen-ph",
            "Geophysics" => "physics.geo-ph",
            "History and Philosophy of Physics" => "physics.hist-ph",
            "Instrumentation and Detectors" => "physics.ins-det",
            "Medical Physics" => "physics.med-ph",
            "Optics" => "physics.optics",
            "Physics and Society" => "physics.soc-ph",
            "Physics Education" => "physics.ed-ph",
            "Plasma Physics" => "physics.plasm-ph",
            "Popular Physics" => "physics.pop-ph",
            "Space Physics" => "physics.space-ph",
        },
    },
    Topic {
        name: "Quantum Physics",
        archive: "quant-ph",
        subjects: Subjects::Unconstrained,
    },
    Topic {
        name: "Mathematics",
        archive: "math",
        subjects: subjects! {
            "Algebraic Geometry" => "math.AG",
            "Algebraic Topology" => "math.AT",
            "Analysis of PDEs" => "math.AP",
            "Category Theory" => "math.CT",
            "Classical Analysis and ODEs" => "math.CA",
            "Combinatorics" => "math.CO",
            "Commutative Algebra" => "math.AC",
            "Complex Variables" => "math.CV",
            "Differential Geometry" => "math.DG",
            "Dynamical Systems" => "math.DS",
            "Functional Analysis" => "math.FA",
            "General Mathematics" => "math.GM",
            "General Topology" => "math.GN",
            "Geometric Topology" => "math.GT",
            "Group Theory" => "math.GR",
            "History and Overview" => "math.HO",
            "Information Theory" => "math.IT",
            "K-Theory and Homology" => "math.KT",
            "Logic" => "math.LO",
            "Mathematical Physics" => "math.MP",
            "Metric Geometry" => "math.MG",
            "Number Theory" => "math.NT",
            "Numerical Analysis" => "math.NA",
            "Operator Algebras" => "math.OA",
            "Optimization and Control" => "math.OC",
            "Probability" => "math.PR",
            "Quantum Algebra" => "math.QA",
            "Representation Theory" => "math.RT",
            "Rings and Algebras" => "math.RA",
            "Spectral Theory" => "math.SP",
            "Statistics Theory" => "math.ST",
            "Symplectic Geometry" => "math.SG",
        },
    },
    Topic {
        name: "Computer Science",
        archive: "cs",
        subjects: subjects! {
            "Artificial Intelligence" => "cs.AI",
            "Computation and Language" => "cs.CL",
            "Computational Complexity" => "cs.CC",
            "Computational Engineering, Finance, and Science" => "cs.CE",
            "Computational Geometry" => "cs.CG",
            "Computer Science and Game Theory" => "cs.GT",
            "Computer Vision and Pattern Recognition" => "cs.CV",
            "Computers and Society" => "cs.CY",
            "Cryptography and Security" => "cs.CR",
            "Data Structures and Algorithms" => "cs.DS",
            "Databases" => "cs.DB",
            "Digital Libraries" => "cs.DL",
            "Discrete Mathematics" => "cs.DM",
            "Distributed, Parallel, and Cluster Computing" => "cs.DC",
            "Emerging Technologies" => "cs.ET",
            "Formal Languages and Automata Theory" => "cs.FL",
            "General Literature" => "cs.GL",
            "Graphics" => "cs.GR",
            "Hardware Architecture" => "cs.AR",
            "Human-Computer Interaction" => "cs.HC",
            "Information Retrieval" => "cs.IR",
            "Information Theory" => "cs.IT",
            "Logic in Computer Science" => "cs.LO",
            "Machine Learning" => "cs.LG",
            "Mathematical Software" => "cs.MS",
            "Multiagent Systems" => "cs.MA",
            "Multimedia" => "cs.MM",
            "Networking and Internet Architecture" => "cs.NI",
            "Neural and Evolutionary Computing" => "cs.NE",
            "Numerical Analysis" => "cs.NA",
            "Operating Systems" => "cs.OS",
            "Other Computer Science" => "cs.OH",
            "Performance" => "cs.PF",
            "Programming Languages" => "cs.PL",
            "Robotics" => "cs.RO",
            "Social and Information Networks" => "cs.SI",
            "Software Engineering" => "cs.SE",
            "Sound" => "cs.SD",
            "Symbolic Computation" => "cs.SC",
            "Systems and Control" => "cs.SY",
        },
    },
    Topic {
        name: "Quantitative Biology",
        archive: "q-bio",
        subjects: subjects! {
            "Biomolecules" => "q-bio.BM",
            "Cell Behavior" => "q-bio.CB",
            "Genomics" => "q-bio.GN",
            "Molecular Networks" => "q-bio.MN",
            "Neurons and Cognition" => "q-bio.NC",
            "Other Quantitative Biology" => "q-bio.OT",
            "Populations and Evolution" => "q-bio.PE",
            "Quantitative Methods" => "q-bio.QM",
            "Subcellular Processes" => "q-bio.SC",
            "Tissues and Organs" => "q-bio.TO",
        },
    },
    Topic {
        name: "Quantitative Finance",
        archive: "q-fin",
        subjects: subjects! {
            "Computational Finance" => "q-fin.CP",
            "Economics" => "q-fin.EC",
            "General Finance" => "q-fin.GN",
            "Mathematical Finance" => "q-fin.MF",
            "Portfolio Management" => "q-fin.PM",
            "Pricing of Securities" => "q-fin.PR",
            "Risk Management" => "q-fin.RM",
            "Statistical Finance" => "q-fin.ST",
            "Trading and Market Microstructure" => "q-fin.TR",
        },
    },
    Topic {
        name: "Statistics",
        archive: "stat",
        subjects: subjects! {
            "Applications" => "stat.AP",
            "Computation" => "stat.CO",
            "Machine Learning" => "stat.ML",
            "Methodology" => "stat.ME",
            "Other Statistics" => "stat.OT",
            "Statistics Theory" => "stat.TH",
        },
    },
    Topic {
        name: "Electrical Engineering and Systems Science",
        archive: "eess",
        subjects: subjects! {
            "Audio and Speech Processing" => "eess.AS",
            "Image and Video Processing" => "eess.IV",
            "Signal Processing" => "eess.SP",
            "Systems and Control" => "eess.SY",
        },
    },
    Topic {
        name: "Economics",
        archive: "econ",
        subjects: subjects! {
            "Econometrics" => "econ.EM",
            "General Economics" => "econ.GN",
            "Theoretical Economics" => "econ.TH",
        },
    },
];

pub fn lookup_topic(name: &str) -> Option<&'static Topic> {
    let name = name.trim();
    TOPICS.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

impl Topic {
    pub fn listed_subjects(&self) -> &'static [Subject] {
        match self.subjects {
            Subjects::Listed(subjects) => subjects,
            Subjects::Unconstrained => &[],
        }
    }

    /// Resolve a subject by display name or category code, ignoring case.
    pub fn find_subject(&self, name_or_code: &str) -> Option<&'static Subject> {
        let needle = name_or_code.trim();
        self.listed_subjects()
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(needle) || s.code.eq_ignore_ascii_case(needle))
    }

    /// Closest subject name, if any is within a few edits of `name`.
    pub fn suggest(&self, name: &str) -> Option<&'static str> {
        let needle = name.trim().to_lowercase();
        self.listed_subjects()
            .iter()
            .map(|s| (s.name, levenshtein(&needle, &s.name.to_lowercase())))
            .filter(|(_, dist)| *dist <= SUGGESTION_DISTANCE)
            .min_by_key(|(_, dist)| *dist)
            .map(|(name, _)| name)
    }

    /// Whether an arXiv category code belongs to this topic's archive.
    pub fn owns_category(&self, code: &str) -> bool {
        code == self.archive
            || code
                .strip_prefix(self.archive)
                .is_some_and(|rest| rest.starts_with('.'))
    }
}

/// "Machine Learning (cs.LG)" for known codes, the bare code otherwise.
pub fn display_category(code: &str) -> String {
    TOPICS
        .iter()
        .flat_map(|t| t.listed_subjects().iter())
        .find(|s| s.code == code)
        .map(|s| format!("{} ({})", s.name, s.code))
        .or_else(|| {
            TOPICS
                .iter()
                .find(|t| t.archive == code)
                .map(|t| format!("{} ({})", t.name, t.archive))
        })
        .unwrap_or_else(|| code.to_string())
}
